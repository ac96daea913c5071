//! Bounded-parallelism task runner.
//!
//! Every external-API-bound piece of work (extraction calls, judge calls,
//! whole-field optimization loops) is pushed through [`run_with_concurrency`]
//! so that the number of in-flight requests never exceeds a configured limit.

use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Why one item of a concurrent run did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError<E> {
    /// The worker returned an error.
    Failed(E),
    /// The worker panicked; the payload message is kept.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(e) => write!(f, "{}", e),
            TaskError::Panicked(msg) => write!(f, "worker panicked: {}", msg),
        }
    }
}

pub type TaskResult<T, E> = std::result::Result<T, TaskError<E>>;

/// Runs `worker` over `items` with at most `limit` invocations in flight.
///
/// `results[i]` always belongs to `items[i]`. Failures and panics are stored
/// in their own slot and never cancel sibling work. A `limit` of 0 is
/// treated as 1.
pub async fn run_with_concurrency<I, T, E, F, Fut>(
    items: Vec<I>,
    limit: usize,
    worker: F,
) -> Vec<TaskResult<T, E>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let total = items.len();
    let mut slots: Vec<Option<TaskResult<T, E>>> = (0..total).map(|_| None).collect();

    let mut completions = stream::iter(items.into_iter().enumerate())
        .map(|(idx, item)| {
            let task = worker(item);
            async move {
                let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(TaskError::Failed(err)),
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
                };
                (idx, outcome)
            }
        })
        .buffer_unordered(limit.max(1));

    while let Some((idx, outcome)) = completions.next().await {
        slots[idx] = Some(outcome);
    }

    slots.into_iter().flatten().collect()
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let items: Vec<u64> = vec![30, 5, 20, 1, 10];
        let results = run_with_concurrency(items.clone(), 3, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, String>(ms * 2)
        })
        .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![60, 10, 40, 2, 20]);
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_siblings() {
        let results = run_with_concurrency(vec![1, 2, 3, 4], 2, |n| async move {
            if n == 2 {
                Err(format!("item {} failed", n))
            } else {
                Ok(n * 10)
            }
        })
        .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(10));
        assert_eq!(
            results[1],
            Err(TaskError::Failed("item 2 failed".to_string()))
        );
        assert_eq!(results[2], Ok(30));
        assert_eq!(results[3], Ok(40));
    }

    #[tokio::test]
    async fn test_limit_bounds_in_flight_workers() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let results = run_with_concurrency((0..12).collect::<Vec<u32>>(), 3, |n| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<u32, ()>(n)
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let results = run_with_concurrency(vec![0, 1], 1, |n| async move {
            if n == 1 {
                panic!("boom");
            }
            Ok::<i32, String>(n)
        })
        .await;

        assert_eq!(results[0], Ok(0));
        assert_eq!(results[1], Err(TaskError::Panicked("boom".to_string())));
    }

    #[tokio::test]
    async fn test_empty_input_and_zero_limit() {
        let results: Vec<TaskResult<u8, ()>> =
            run_with_concurrency(Vec::<u8>::new(), 0, |n| async move { Ok(n) }).await;
        assert!(results.is_empty());

        let results = run_with_concurrency(vec![7u8], 0, |n| async move { Ok::<u8, ()>(n) }).await;
        assert_eq!(results, vec![Ok(7)]);
    }
}
