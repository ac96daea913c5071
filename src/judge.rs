//! LLM-as-judge comparison of an extracted value against ground truth.

use crate::error::ServiceError;
use crate::schema::{ComparisonOutcome, Confidence, MatchType};
use crate::services::{ContextRef, ModelService};
use crate::utils::{call_with_timeout, truncate_for_prompt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_JUDGE_CRITERIA: &str =
    "The values match if they refer to the same real-world value, ignoring formatting, casing and abbreviations.";

const NO_REASON: &str = "no reason provided";
const AMBIGUOUS_REASON: &str = "ambiguous";
const REASON_LABEL: &str = "reason:";
const MAX_VALUE_CHARS: usize = 2_000;

const NEGATIVE_VERDICTS: &[&str] = &["NO_MATCH", "NO MATCH", "NOT_MATCH", "NOT A MATCH", "MISMATCH"];

pub fn build_judge_prompt(ground_truth: &str, extracted: &str, criteria: &str) -> String {
    let criteria = if criteria.trim().is_empty() {
        DEFAULT_JUDGE_CRITERIA
    } else {
        criteria.trim()
    };
    format!(
        "You are comparing a value extracted from a document against the expected value.\n\
         Ignore the attached file; it is only a placeholder.\n\n\
         ## COMPARISON CRITERIA\n{}\n\n\
         ## EXPECTED VALUE\n{}\n\n\
         ## EXTRACTED VALUE\n{}\n\n\
         ## RESPONSE FORMAT\n\
         Line 1: exactly MATCH or NO_MATCH\n\
         Line 2: Reason: <one sentence>\n\
         Do not add anything else.",
        criteria,
        truncate_for_prompt(ground_truth, MAX_VALUE_CHARS),
        truncate_for_prompt(extracted, MAX_VALUE_CHARS),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeVerdict {
    pub is_match: bool,
    pub reason: String,
    pub ambiguous: bool,
}

/// Reads a judge reply. Never fails: unreadable replies are a non-match.
pub fn parse_judge_response(raw: &str) -> JudgeVerdict {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let Some(first) = lines.first() else {
        return JudgeVerdict {
            is_match: false,
            reason: AMBIGUOUS_REASON.to_string(),
            ambiguous: true,
        };
    };

    let verdict = first.to_uppercase();
    let is_match = if NEGATIVE_VERDICTS.iter().any(|n| verdict.contains(n)) {
        false
    } else if verdict.contains("MATCH") {
        true
    } else {
        return JudgeVerdict {
            is_match: false,
            reason: AMBIGUOUS_REASON.to_string(),
            ambiguous: true,
        };
    };

    let labelled = lines
        .iter()
        .find(|line| is_reason_label(line))
        .map(|line| line[REASON_LABEL.len()..].trim().to_string());
    let reason = labelled
        .filter(|r| !r.is_empty())
        .or_else(|| {
            lines
                .get(1)
                .filter(|l| !is_reason_label(l))
                .map(|l| l.to_string())
        })
        .unwrap_or_else(|| NO_REASON.to_string());

    JudgeVerdict {
        is_match,
        reason,
        ambiguous: false,
    }
}

fn is_reason_label(line: &str) -> bool {
    line.get(..REASON_LABEL.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(REASON_LABEL))
}

/// Lazily created placeholder context shared by all judge calls.
///
/// Reads go through a read lock. Creation is single-flight: callers that
/// find the slot empty queue on `creation` and re-check before creating.
#[derive(Debug, Default)]
pub struct PlaceholderContextCache {
    current: RwLock<Option<ContextRef>>,
    creation: Mutex<()>,
}

impl PlaceholderContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cached(&self) -> Option<ContextRef> {
        self.current.read().await.clone()
    }

    pub async fn acquire(
        &self,
        service: &dyn ModelService,
        timeout: Duration,
    ) -> Result<ContextRef, ServiceError> {
        if let Some(context) = self.cached().await {
            return Ok(context);
        }

        let _guard = self.creation.lock().await;
        if let Some(context) = self.cached().await {
            return Ok(context);
        }

        let context = call_with_timeout(timeout, service.create_placeholder_context()).await?;
        info!("Created placeholder context {}", context.id);
        *self.current.write().await = Some(context.clone());
        Ok(context)
    }

    /// Drops `stale` from the cache unless it was already replaced.
    pub async fn invalidate(&self, stale: &ContextRef) {
        let mut current = self.current.write().await;
        if current.as_ref() == Some(stale) {
            debug!("Invalidating placeholder context {}", stale.id);
            *current = None;
        }
    }
}

#[derive(Clone)]
pub struct LlmJudge {
    service: Arc<dyn ModelService>,
    model: String,
    timeout: Duration,
    contexts: Arc<PlaceholderContextCache>,
}

impl LlmJudge {
    pub fn new(service: Arc<dyn ModelService>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service,
            model: model.into(),
            timeout,
            contexts: Arc::new(PlaceholderContextCache::new()),
        }
    }

    /// Shares an existing cache, e.g. between judges for different models.
    pub fn with_context_cache(mut self, contexts: Arc<PlaceholderContextCache>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn context_cache(&self) -> &Arc<PlaceholderContextCache> {
        &self.contexts
    }

    /// Asks the judge model for a verdict.
    pub async fn judge(
        &self,
        ground_truth: &str,
        extracted: &str,
        criteria: &str,
    ) -> Result<JudgeVerdict, ServiceError> {
        let prompt = build_judge_prompt(ground_truth, extracted, criteria);
        let raw = generate_with_placeholder(
            self.service.as_ref(),
            &self.contexts,
            &self.model,
            &prompt,
            self.timeout,
        )
        .await?;
        Ok(parse_judge_response(&raw))
    }

    /// Like [`judge`](Self::judge) but folds failures into the outcome.
    pub async fn compare(&self, ground_truth: &str, extracted: &str, criteria: &str) -> ComparisonOutcome {
        match self.judge(ground_truth, extracted, criteria).await {
            Ok(verdict) => {
                let confidence = if verdict.ambiguous {
                    Confidence::Low
                } else {
                    Confidence::Medium
                };
                let outcome = if verdict.is_match {
                    ComparisonOutcome::matched(MatchType::LlmJudge, confidence)
                } else {
                    ComparisonOutcome::unmatched(MatchType::LlmJudge, confidence)
                };
                outcome.with_details(verdict.reason)
            }
            Err(err) => {
                warn!("Judge call failed: {}", err);
                ComparisonOutcome::failed(MatchType::LlmJudge, err.to_string())
            }
        }
    }
}

/// Runs a generation call bound to the shared placeholder context.
///
/// A "not found" failure means the placeholder expired: the cache is
/// invalidated and the call is retried once with a fresh context.
pub async fn generate_with_placeholder(
    service: &dyn ModelService,
    contexts: &PlaceholderContextCache,
    model: &str,
    prompt: &str,
    timeout: Duration,
) -> Result<String, ServiceError> {
    let context = contexts.acquire(service, timeout).await?;
    let call = |context: ContextRef| async move {
        call_with_timeout(
            timeout,
            service.generate(model, prompt, std::slice::from_ref(&context)),
        )
        .await
    };

    match call(context.clone()).await {
        Err(err) if err.is_not_found() => {
            warn!(
                "Placeholder context {} is gone ({}); recreating and retrying once",
                context.id, err
            );
            contexts.invalidate(&context).await;
            let fresh = contexts.acquire(service, timeout).await?;
            call(fresh).await
        }
        other => other,
    }
}
