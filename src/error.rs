use std::time::Duration;
use thiserror::Error;

/// Failures reported by an external collaborator (extraction, judge, generation, storage).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// True when the failure means a referenced remote object no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            ServiceError::NotFound(_) => true,
            ServiceError::Request(msg) | ServiceError::InvalidResponse(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("not found") || lower.contains("not_found")
            }
            ServiceError::Timeout(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("No comparison results available for template '{0}': run a comparison before optimizing")]
    NoComparisonData(String),

    #[error("A field name is required to build a fallback prompt")]
    MissingFieldName,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown field '{0}' in work plan")]
    UnknownField(String),

    #[error("Got {predictions} predictions but {ground_truths} ground truth values")]
    LengthMismatch {
        predictions: usize,
        ground_truths: usize,
    },

    #[error("Field '{0}' uses llm-judge comparison but no judge is configured")]
    JudgeUnavailable(String),

    #[error("Upstream service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[cfg(feature = "gemini")]
impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            ServiceError::NotFound(err.to_string())
        } else {
            ServiceError::Request(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
