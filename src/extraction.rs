//! Batch extraction over the concurrency executor.

use crate::concurrency::{panic_message, run_with_concurrency};
use crate::services::{ExtractionRequest, ExtractionService, FieldSpec};
use crate::utils::call_with_timeout;
use futures::future::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionJob {
    pub document_id: String,
    pub document_name: String,
    pub model: String,
    pub fields: Vec<FieldSpec>,
    pub template_key: String,
}

impl ExtractionJob {
    pub fn request(&self) -> ExtractionRequest {
        ExtractionRequest {
            document_id: self.document_id.clone(),
            fields: self.fields.clone(),
            model: self.model.clone(),
            template_key: self.template_key.clone(),
        }
    }
}

/// Outcome of one job. Exactly one of `values` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRecord {
    pub document_id: String,
    pub document_name: String,
    pub model: String,
    pub values: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExtractionRecord {
    fn failure(job: &ExtractionJob, error: String, elapsed_ms: u64) -> Self {
        Self {
            document_id: job.document_id.clone(),
            document_name: job.document_name.clone(),
            model: job.model.clone(),
            values: None,
            error: Some(error),
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.values.is_some()
    }

    pub fn value(&self, field_key: &str) -> Option<&str> {
        self.values.as_ref()?.get(field_key).map(String::as_str)
    }
}

/// Passed to the progress callback after each job completes.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress<'a> {
    pub record: &'a ExtractionRecord,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

pub type ProgressCallback = Arc<dyn Fn(&BatchProgress<'_>) + Send + Sync>;

#[derive(Default)]
struct Totals {
    completed: usize,
    succeeded: usize,
    failed: usize,
}

/// Runs extraction jobs with a bounded number of calls in flight.
#[derive(Clone)]
pub struct BatchExtractor {
    service: Arc<dyn ExtractionService>,
    concurrency: usize,
    timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl BatchExtractor {
    pub fn new(service: Arc<dyn ExtractionService>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            service,
            concurrency,
            timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// `records[i]` belongs to `jobs[i]`. Never fails as a whole.
    pub async fn run(&self, jobs: Vec<ExtractionJob>) -> Vec<ExtractionRecord> {
        self.run_with_limit(jobs, self.concurrency).await
    }

    /// One job through the batch path with a limit of 1.
    pub async fn extract_one(&self, job: ExtractionJob) -> ExtractionRecord {
        let fallback = job.clone();
        self.run_with_limit(vec![job], 1)
            .await
            .pop()
            .unwrap_or_else(|| ExtractionRecord::failure(&fallback, "job produced no result".to_string(), 0))
    }

    async fn run_with_limit(&self, jobs: Vec<ExtractionJob>, limit: usize) -> Vec<ExtractionRecord> {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        info!("Extracting {} job(s) with concurrency {}", total, limit.max(1));

        let totals = Mutex::new(Totals::default());
        let slots = run_with_concurrency(jobs.clone(), limit, |job| {
            let totals = &totals;
            async move {
                let record = self.execute(&job).await;
                self.report(totals, &record, total);
                Ok::<_, Infallible>(record)
            }
        })
        .await;

        let records: Vec<ExtractionRecord> = slots
            .into_iter()
            .zip(&jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|e| {
                    warn!("Progress reporting for {} failed: {}", job.document_id, e);
                    ExtractionRecord::failure(job, e.to_string(), 0)
                })
            })
            .collect();

        let failed = records.iter().filter(|r| !r.is_success()).count();
        info!(
            "Extraction finished: {} succeeded, {} failed",
            total - failed,
            failed
        );
        records
    }

    async fn execute(&self, job: &ExtractionJob) -> ExtractionRecord {
        let request = job.request();
        let started = Instant::now();
        let call = call_with_timeout(self.timeout, self.service.extract(&request));
        let result = AssertUnwindSafe(call).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(values)) => {
                debug!(
                    "Extracted {} value(s) from {} with {} in {}ms",
                    values.len(),
                    job.document_id,
                    job.model,
                    elapsed_ms
                );
                ExtractionRecord {
                    document_id: job.document_id.clone(),
                    document_name: job.document_name.clone(),
                    model: job.model.clone(),
                    values: Some(values),
                    error: None,
                    elapsed_ms,
                }
            }
            Ok(Err(err)) => {
                warn!("Extraction of {} with {} failed: {}", job.document_id, job.model, err);
                ExtractionRecord::failure(job, err.to_string(), elapsed_ms)
            }
            Err(payload) => {
                let message = format!("extraction panicked: {}", panic_message(payload));
                warn!("Extraction of {} with {}: {}", job.document_id, job.model, message);
                ExtractionRecord::failure(job, message, elapsed_ms)
            }
        }
    }

    fn report(&self, totals: &Mutex<Totals>, record: &ExtractionRecord, total: usize) {
        let Some(progress) = &self.progress else {
            return;
        };
        // The lock is held across the callback so calls never overlap.
        let mut totals = totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        totals.completed += 1;
        if record.is_success() {
            totals.succeeded += 1;
        } else {
            totals.failed += 1;
        }
        let update = BatchProgress {
            record,
            completed: totals.completed,
            succeeded: totals.succeeded,
            failed: totals.failed,
            total,
        };
        // A panicking callback must not turn the finished record into a failure.
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| progress(&update))) {
            warn!(
                "Progress callback for {} panicked: {}",
                record.document_id,
                panic_message(payload)
            );
        }
    }
}
