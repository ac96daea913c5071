//! Accuracy, precision, recall and F1 for one field over a set of documents.
//!
//! Each (prediction, ground truth) pair is first compared, then placed in
//! exactly one confusion cell:
//!
//! | prediction | ground truth | compared | cell |
//! |------------|--------------|----------|------|
//! | absent     | absent       | -        | TN   |
//! | present    | absent       | -        | FP   |
//! | absent     | present      | -        | FN   |
//! | present    | present      | match    | TP   |
//! | present    | present      | no match | FP   |
//!
//! "Absent" means empty or the configured not-present marker, so a wrong
//! value and a missing value land in different cells.

use crate::concurrency::run_with_concurrency;
use crate::error::{OptimizerError, Result};
use crate::judge::LlmJudge;
use crate::schema::{ComparisonOutcome, ComparisonStrategy, Confidence, FailureExample, MatchType};
use crate::utils::{is_absent, normalize_text, parse_number};
use log::debug;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairClass {
    TruePositive,
    FalsePositive,
    FalseNegative,
    TrueNegative,
}

impl PairClass {
    pub fn is_correct(&self) -> bool {
        matches!(self, PairClass::TruePositive | PairClass::TrueNegative)
    }
}

pub fn classify(prediction_absent: bool, ground_truth_absent: bool, is_match: bool) -> PairClass {
    match (prediction_absent, ground_truth_absent) {
        (true, true) => PairClass::TrueNegative,
        (false, true) => PairClass::FalsePositive,
        (true, false) => PairClass::FalseNegative,
        (false, false) if is_match => PairClass::TruePositive,
        (false, false) => PairClass::FalsePositive,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct FieldMetrics {
    pub total: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl FieldMetrics {
    pub fn from_classes(classes: &[PairClass]) -> Self {
        let count = |c: PairClass| classes.iter().filter(|x| **x == c).count();
        let tp = count(PairClass::TruePositive);
        let fp = count(PairClass::FalsePositive);
        let fn_ = count(PairClass::FalseNegative);
        let tn = count(PairClass::TrueNegative);
        let total = classes.len();

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Self {
            total,
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            true_negatives: tn,
            accuracy: ratio(tp + tn, total),
            precision,
            recall,
            f1,
        }
    }
}

/// The comparison actually used for one document, kept for reviewers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentComparison {
    pub document_id: Option<String>,
    pub predicted: String,
    pub expected: String,
    pub class: PairClass,
    pub outcome: ComparisonOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsReport {
    pub metrics: FieldMetrics,
    pub comparisons: Vec<DocumentComparison>,
}

impl MetricsReport {
    pub fn failure_examples(&self) -> Vec<FailureExample> {
        self.comparisons
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.class.is_correct())
            .map(|(idx, c)| FailureExample {
                document_id: c.document_id.clone().unwrap_or_else(|| idx.to_string()),
                predicted: c.predicted.clone(),
                expected: c.expected.clone(),
            })
            .collect()
    }

    pub fn success_examples(&self) -> Vec<FailureExample> {
        self.comparisons
            .iter()
            .enumerate()
            .filter(|(_, c)| c.class == PairClass::TruePositive)
            .map(|(idx, c)| FailureExample {
                document_id: c.document_id.clone().unwrap_or_else(|| idx.to_string()),
                predicted: c.predicted.clone(),
                expected: c.expected.clone(),
            })
            .collect()
    }
}

/// Applies a string/number rule. `None` means the pair has to go to the judge.
pub fn rule_outcome(prediction: &str, ground_truth: &str, strategy: &ComparisonStrategy) -> Option<ComparisonOutcome> {
    let (p, g) = (prediction.trim(), ground_truth.trim());
    if p == g {
        return Some(ComparisonOutcome::matched(MatchType::Exact, Confidence::High));
    }

    match strategy {
        ComparisonStrategy::ExactString => Some(
            ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::High)
                .with_details("values differ"),
        ),
        ComparisonStrategy::NearExactString => Some(near_exact(p, g)),
        ComparisonStrategy::NumericTolerance { tolerance } => {
            Some(match (parse_number(p), parse_number(g)) {
                (Some(a), Some(b)) if (a - b).abs() <= *tolerance => {
                    ComparisonOutcome::matched(MatchType::NumericTolerance, Confidence::High)
                        .with_details(format!("|{} - {}| <= {}", a, b, tolerance))
                }
                (Some(a), Some(b)) => ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::High)
                    .with_details(format!("|{} - {}| > {}", a, b, tolerance)),
                _ => ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::Low)
                    .with_details("value is not numeric"),
            })
        }
        ComparisonStrategy::LlmJudge { .. } => {
            if normalize_text(p) == normalize_text(g) {
                Some(ComparisonOutcome::matched(MatchType::NearExactString, Confidence::High))
            } else {
                None
            }
        }
    }
}

fn near_exact(prediction: &str, ground_truth: &str) -> ComparisonOutcome {
    if normalize_text(prediction) == normalize_text(ground_truth) {
        ComparisonOutcome::matched(MatchType::NearExactString, Confidence::High)
    } else {
        ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::High)
            .with_details("values differ after normalization")
    }
}

/// Outcome for pairs where at least one side is absent, or `None` if both are present.
fn presence_outcome(prediction_absent: bool, ground_truth_absent: bool) -> Option<ComparisonOutcome> {
    match (prediction_absent, ground_truth_absent) {
        (true, true) => Some(
            ComparisonOutcome::matched(MatchType::BothAbsent, Confidence::High)
                .with_details("field absent in both"),
        ),
        (false, true) => Some(
            ComparisonOutcome::unmatched(MatchType::PresenceMismatch, Confidence::High)
                .with_details("value extracted but ground truth says absent"),
        ),
        (true, false) => Some(
            ComparisonOutcome::unmatched(MatchType::PresenceMismatch, Confidence::High)
                .with_details("value missing from extraction"),
        ),
        (false, false) => None,
    }
}

pub struct MetricsEngine {
    judge: Option<LlmJudge>,
    comparison_concurrency: usize,
    not_present_marker: String,
}

impl MetricsEngine {
    pub fn new(not_present_marker: impl Into<String>, comparison_concurrency: usize) -> Self {
        Self {
            judge: None,
            comparison_concurrency,
            not_present_marker: not_present_marker.into(),
        }
    }

    pub fn with_judge(mut self, judge: LlmJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Compares rule-based strategies only. Fails for llm-judge fields.
    pub fn evaluate_with_rules(
        &self,
        field_key: &str,
        predictions: &[String],
        ground_truths: &[String],
        strategy: &ComparisonStrategy,
        document_ids: Option<&[String]>,
    ) -> Result<MetricsReport> {
        check_lengths(predictions, ground_truths)?;
        let mut outcomes = Vec::with_capacity(predictions.len());
        for (p, g) in predictions.iter().zip(ground_truths) {
            let outcome = self
                .local_outcome(p, g, strategy)
                .ok_or_else(|| OptimizerError::JudgeUnavailable(field_key.to_string()))?;
            outcomes.push(outcome);
        }
        Ok(self.report(predictions, ground_truths, outcomes, document_ids))
    }

    /// Compares every pair; llm-judge pairs that are not trivially equal are
    /// sent to the judge with bounded fan-out. A failed judge call marks only
    /// its own pair as a non-match.
    pub async fn evaluate(
        &self,
        field_key: &str,
        predictions: &[String],
        ground_truths: &[String],
        strategy: &ComparisonStrategy,
        document_ids: Option<&[String]>,
    ) -> Result<MetricsReport> {
        check_lengths(predictions, ground_truths)?;

        let mut outcomes: Vec<Option<ComparisonOutcome>> = predictions
            .iter()
            .zip(ground_truths)
            .map(|(p, g)| self.local_outcome(p, g, strategy))
            .collect();

        let pending: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_none())
            .map(|(idx, _)| idx)
            .collect();

        if !pending.is_empty() {
            let criteria = match strategy {
                ComparisonStrategy::LlmJudge { criteria } => criteria.as_str(),
                _ => "",
            };
            let judge = self
                .judge
                .as_ref()
                .ok_or_else(|| OptimizerError::JudgeUnavailable(field_key.to_string()))?;

            debug!(
                "Field '{}': sending {} of {} pairs to the judge",
                field_key,
                pending.len(),
                predictions.len()
            );

            let verdicts = run_with_concurrency(pending.clone(), self.comparison_concurrency, |idx| {
                let expected = ground_truths[idx].as_str();
                let predicted = predictions[idx].as_str();
                async move { Ok::<_, Infallible>(judge.compare(expected, predicted, criteria).await) }
            })
            .await;

            for (idx, verdict) in pending.into_iter().zip(verdicts) {
                outcomes[idx] = Some(verdict.unwrap_or_else(|e| {
                    ComparisonOutcome::failed(MatchType::LlmJudge, e.to_string())
                }));
            }
        }

        let outcomes = outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| ComparisonOutcome::failed(MatchType::LlmJudge, "comparison was not run"))
            })
            .collect();
        Ok(self.report(predictions, ground_truths, outcomes, document_ids))
    }

    fn local_outcome(&self, prediction: &str, ground_truth: &str, strategy: &ComparisonStrategy) -> Option<ComparisonOutcome> {
        let p_absent = is_absent(prediction, &self.not_present_marker);
        let g_absent = is_absent(ground_truth, &self.not_present_marker);
        presence_outcome(p_absent, g_absent).or_else(|| rule_outcome(prediction, ground_truth, strategy))
    }

    fn report(
        &self,
        predictions: &[String],
        ground_truths: &[String],
        outcomes: Vec<ComparisonOutcome>,
        document_ids: Option<&[String]>,
    ) -> MetricsReport {
        let comparisons: Vec<DocumentComparison> = predictions
            .iter()
            .zip(ground_truths)
            .zip(outcomes)
            .enumerate()
            .map(|(idx, ((p, g), outcome))| DocumentComparison {
                document_id: document_ids.and_then(|ids| ids.get(idx).cloned()),
                predicted: p.clone(),
                expected: g.clone(),
                class: classify(
                    is_absent(p, &self.not_present_marker),
                    is_absent(g, &self.not_present_marker),
                    outcome.is_match,
                ),
                outcome,
            })
            .collect();

        let classes: Vec<PairClass> = comparisons.iter().map(|c| c.class).collect();
        MetricsReport {
            metrics: FieldMetrics::from_classes(&classes),
            comparisons,
        }
    }
}

fn check_lengths(predictions: &[String], ground_truths: &[String]) -> Result<()> {
    if predictions.len() != ground_truths.len() {
        return Err(OptimizerError::LengthMismatch {
            predictions: predictions.len(),
            ground_truths: ground_truths.len(),
        });
    }
    Ok(())
}
