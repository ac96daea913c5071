use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Currency,
    Date,
    Boolean,
    Enum,
    List,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Currency => "currency",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
            FieldType::Enum => "enum",
            FieldType::List => "list",
        }
    }
}

/// How a prediction is compared against ground truth for one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ComparisonStrategy {
    /// Trimmed, case-sensitive equality.
    #[default]
    ExactString,
    /// Case-folded, whitespace-collapsed, surrounding punctuation ignored.
    NearExactString,
    /// Both sides parse as numbers and differ by at most `tolerance`.
    NumericTolerance { tolerance: f64 },
    /// A judge model decides semantic equivalence using `criteria`.
    LlmJudge { criteria: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub comparison: ComparisonStrategy,
}

impl FieldDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            field_type,
            enum_values: Vec::new(),
            comparison: ComparisonStrategy::default(),
        }
    }

    pub fn with_comparison(mut self, comparison: ComparisonStrategy) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_enum_values(mut self, values: Vec<String>) -> Self {
        self.enum_values = values;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    NearExactString,
    NumericTolerance,
    LlmJudge,
    /// Both sides absent.
    BothAbsent,
    /// Exactly one side absent.
    PresenceMismatch,
    /// Both present, rule said no.
    Mismatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonOutcome {
    pub is_match: bool,
    pub match_type: MatchType,
    pub confidence: Confidence,
    pub details: Option<String>,
    pub error: Option<String>,
}

impl ComparisonOutcome {
    pub fn matched(match_type: MatchType, confidence: Confidence) -> Self {
        Self {
            is_match: true,
            match_type,
            confidence,
            details: None,
            error: None,
        }
    }

    pub fn unmatched(match_type: MatchType, confidence: Confidence) -> Self {
        Self {
            is_match: false,
            match_type,
            confidence,
            details: None,
            error: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// A comparison that could not be decided because an upstream call failed.
    pub fn failed(match_type: MatchType, error: impl Into<String>) -> Self {
        Self {
            is_match: false,
            match_type,
            confidence: Confidence::Low,
            details: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub document_id: String,
    pub document_name: String,
    pub ground_truth_value: String,
    pub extracted_value: String,
    pub comparison_reason: String,
}

/// Failing documents per field key. Iteration order is the key order.
pub type FieldFailureMap = BTreeMap<String, Vec<FailureRecord>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampledDocument {
    pub document_id: String,
    pub document_name: String,
    pub covered_field_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SamplingResult {
    pub documents: Vec<SampledDocument>,
    pub field_to_document_ids: BTreeMap<String, BTreeSet<String>>,
    /// Failing fields the document budget could not reach.
    #[serde(default)]
    pub uncovered_fields: Vec<String>,
}

impl SamplingResult {
    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.document_id.clone()).collect()
    }
}

/// One (field, document) row of a previous comparison run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    pub field_key: String,
    pub document_id: String,
    pub document_name: String,
    pub model: String,
    pub extracted_value: String,
    pub ground_truth_value: String,
    pub outcome: ComparisonOutcome,
}

/// Comparison results for one template, the input to plan building.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccuracySnapshot {
    pub template_key: String,
    pub test_model: String,
    pub fields: Vec<FieldDefinition>,
    pub rows: Vec<ComparisonRow>,
}

impl AccuracySnapshot {
    pub fn field(&self, key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Rows for one field scored against the snapshot's test model.
    pub fn rows_for<'a>(&'a self, field_key: &'a str) -> impl Iterator<Item = &'a ComparisonRow> + 'a {
        self.rows
            .iter()
            .filter(move |r| r.field_key == field_key && r.model == self.test_model)
    }

    /// Match rate of a field over its rows, or `None` when it has no rows.
    pub fn field_accuracy(&self, field_key: &str) -> Option<f64> {
        let (total, matched) = self
            .rows_for(field_key)
            .fold((0usize, 0usize), |(t, m), r| (t + 1, m + usize::from(r.outcome.is_match)));
        if total == 0 {
            None
        } else {
            Some(matched as f64 / total as f64)
        }
    }

    pub fn document_name(&self, document_id: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|r| r.document_id == document_id)
            .map(|r| r.document_name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldPlan {
    pub field_key: String,
    pub field_definition: FieldDefinition,
    pub initial_accuracy: f64,
    /// Ground truth for the sampled documents, keyed by document id.
    pub ground_truth: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkPlan {
    pub run_id: String,
    pub template_key: String,
    pub test_model: String,
    pub sampled_document_ids: Vec<String>,
    pub sampled_documents: Vec<DocumentRef>,
    pub fields: Vec<FieldPlan>,
    /// Failing fields with no sampled document (budget too small).
    #[serde(default)]
    pub untested_fields: Vec<String>,
}

impl WorkPlan {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureExample {
    pub document_id: String,
    pub predicted: String,
    pub expected: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationResult {
    pub iteration: u32,
    /// Prompt that was run in this iteration.
    pub tested_prompt: String,
    /// Prompt for the next iteration: synthesized, or the tested one when confirmed.
    pub new_prompt: String,
    pub accuracy: f64,
    pub converged: bool,
    pub reasoning: Option<String>,
    pub failure_examples: Option<Vec<FailureExample>>,
}

/// A prompt that was tried, as shown to the synthesis model and saved as history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptAttempt {
    pub iteration: u32,
    pub prompt: String,
    pub accuracy: f64,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldOutcome {
    Converged,
    Exhausted,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldResult {
    pub field_key: String,
    pub field_name: String,
    pub initial_accuracy: f64,
    pub final_accuracy: f64,
    pub iteration_count: u32,
    pub final_prompt: String,
    pub initial_prompt: String,
    pub converged: bool,
    pub sampled_document_ids: Vec<String>,
    pub improved: bool,
    pub outcome: FieldOutcome,
    pub error: Option<String>,
    pub iterations: Vec<IterationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub template_key: String,
    pub test_model: String,
    pub field_results: Vec<FieldResult>,
    pub sampled_document_ids: Vec<String>,
    pub sampled_document_names: Vec<String>,
    pub untested_fields: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub estimated_seconds: f64,
    pub actual_seconds: f64,
}

impl RunSummary {
    pub fn improved_count(&self) -> usize {
        self.field_results.iter().filter(|r| r.improved).count()
    }

    pub fn converged_count(&self) -> usize {
        self.field_results.iter().filter(|r| r.converged).count()
    }
}
