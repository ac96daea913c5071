use crate::error::{OptimizerError, Result};
use crate::schema::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_NOT_PRESENT_MARKER: &str = "NOT_PRESENT";

/// The fallback prompt is always longer than this, so the quality floor may not exceed it.
pub const MAX_MIN_PROMPT_LENGTH: usize = 150;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Upper bound on documents picked by the sampler per run.
    pub max_sampled_documents: usize,
    /// Test passes allowed per field.
    pub max_iterations: u32,
    /// Accuracy (0.0-1.0) at which a field counts as solved.
    pub target_accuracy: f64,
    pub extraction_concurrency: usize,
    pub comparison_concurrency: usize,
    /// Fields optimized at the same time.
    pub field_concurrency: usize,
    pub call_timeout_secs: u64,
    pub generation_model: String,
    pub judge_model: String,
    pub default_test_model: String,
    pub system_prompt_overrides: BTreeMap<String, String>,
    pub custom_instructions: Option<String>,
    pub document_type_hint: Option<String>,
    pub max_previous_attempts: usize,
    pub synthesis_attempts: u32,
    pub min_prompt_length: usize,
    pub not_present_marker: String,
    pub estimated_seconds_per_call: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_sampled_documents: 5,
            max_iterations: 3,
            target_accuracy: 1.0,
            extraction_concurrency: 4,
            comparison_concurrency: 4,
            field_concurrency: 2,
            call_timeout_secs: 120,
            generation_model: "gemini-2.5-pro".to_string(),
            judge_model: "gemini-2.5-flash".to_string(),
            default_test_model: "gemini-2.5-flash".to_string(),
            system_prompt_overrides: BTreeMap::new(),
            custom_instructions: None,
            document_type_hint: None,
            max_previous_attempts: 3,
            synthesis_attempts: 2,
            min_prompt_length: 20,
            not_present_marker: DEFAULT_NOT_PRESENT_MARKER.to_string(),
            estimated_seconds_per_call: 8.0,
        }
    }
}

impl OptimizerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.target_accuracy) {
            return Err(OptimizerError::InvalidConfig(format!(
                "target_accuracy {} must be between 0.0 and 1.0",
                self.target_accuracy
            )));
        }
        let limits = [
            ("max_sampled_documents", self.max_sampled_documents),
            ("extraction_concurrency", self.extraction_concurrency),
            ("comparison_concurrency", self.comparison_concurrency),
            ("field_concurrency", self.field_concurrency),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(OptimizerError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        if self.max_iterations == 0 {
            return Err(OptimizerError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.synthesis_attempts == 0 {
            return Err(OptimizerError::InvalidConfig(
                "synthesis_attempts must be at least 1".to_string(),
            ));
        }
        if self.min_prompt_length > MAX_MIN_PROMPT_LENGTH {
            return Err(OptimizerError::InvalidConfig(format!(
                "min_prompt_length {} exceeds the maximum of {}",
                self.min_prompt_length, MAX_MIN_PROMPT_LENGTH
            )));
        }
        if self.not_present_marker.trim().is_empty() {
            return Err(OptimizerError::InvalidConfig(
                "not_present_marker must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn system_prompt_for(&self, field_key: &str) -> Option<&str> {
        self.system_prompt_overrides.get(field_key).map(String::as_str)
    }
}

/// Keyword rule that maps a field name to a likely type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldTypeHeuristic {
    pub keywords: Vec<String>,
    pub field_type: FieldType,
    pub guidance: String,
}

/// Model names and field-type hints shared across the pipeline.
///
/// Passed in explicitly so tests can swap in fixtures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalog {
    pub version: String,
    pub extraction_models: Vec<String>,
    pub field_type_heuristics: Vec<FieldTypeHeuristic>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let rule = |keywords: &[&str], field_type: FieldType, guidance: &str| FieldTypeHeuristic {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            field_type,
            guidance: guidance.to_string(),
        };
        Self {
            version: "2025-01".to_string(),
            extraction_models: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
            ],
            field_type_heuristics: vec![
                rule(
                    &["date", "expires", "expiration", "effective", "signed on"],
                    FieldType::Date,
                    "Ask for one normalized date format (YYYY-MM-DD) and say which date to pick when several appear.",
                ),
                rule(
                    &["amount", "total", "price", "fee", "cost", "payment"],
                    FieldType::Currency,
                    "Say whether to include currency symbols and thousands separators, and which total to use.",
                ),
                rule(
                    &["count", "number of", "quantity", "term"],
                    FieldType::Number,
                    "Ask for digits only and state the unit explicitly.",
                ),
                rule(
                    &["is ", "has ", "whether", "flag"],
                    FieldType::Boolean,
                    "Constrain the answer to exactly Yes or No.",
                ),
            ],
        }
    }
}

impl ModelCatalog {
    pub fn is_known_model(&self, model: &str) -> bool {
        self.extraction_models.iter().any(|m| m == model)
    }

    /// First heuristic whose keyword occurs in the lower-cased field name.
    pub fn heuristic_for(&self, field_name: &str) -> Option<&FieldTypeHeuristic> {
        let lower = format!("{} ", field_name.to_lowercase());
        self.field_type_heuristics
            .iter()
            .find(|h| h.keywords.iter().any(|k| lower.contains(k.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_accuracy, 1.0);
        assert_eq!(config.call_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = OptimizerConfig::from_json_str(r#"{"max_iterations": 5}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.max_sampled_documents, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = OptimizerConfig {
            target_accuracy: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OptimizerError::InvalidConfig(_))
        ));

        let config = OptimizerConfig {
            extraction_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OptimizerConfig {
            min_prompt_length: MAX_MIN_PROMPT_LENGTH + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_heuristics() {
        let catalog = ModelCatalog::default();
        let rule = catalog.heuristic_for("Effective Date").unwrap();
        assert_eq!(rule.field_type, FieldType::Date);
        assert!(catalog.heuristic_for("Vendor").is_none());
        assert!(catalog.is_known_model("gemini-2.5-flash"));
    }
}
