//! Boundaries to the systems this crate drives but does not own.

use crate::error::ServiceError;
use crate::schema::{AccuracySnapshot, FieldType, PromptAttempt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// One field the extraction model is asked to fill in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    pub key: String,
    pub name: String,
    pub field_type: FieldType,
    pub prompt: String,
    /// Replaces the service's default system prompt for this field.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRequest {
    pub document_id: String,
    pub fields: Vec<FieldSpec>,
    pub model: String,
    pub template_key: String,
}

/// Runs one extraction and returns values keyed by field key.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<BTreeMap<String, String>, ServiceError>;
}

/// A remote object that can be bound to a generation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContextRef {
    pub id: String,
    pub uri: String,
}

/// Free-text generation used for judging and prompt synthesis.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        contexts: &[ContextRef],
    ) -> Result<String, ServiceError>;

    /// Creates a minimal context item for calls that have no real document.
    async fn create_placeholder_context(&self) -> Result<ContextRef, ServiceError>;
}

/// Read-only ground truth lookup.
pub trait GroundTruthStore {
    fn get(&self, document_id: &str, field_key: &str) -> Option<String>;
}

impl GroundTruthStore for AccuracySnapshot {
    fn get(&self, document_id: &str, field_key: &str) -> Option<String> {
        self.rows
            .iter()
            .find(|r| r.document_id == document_id && r.field_key == field_key)
            .map(|r| r.ground_truth_value.clone())
    }
}

impl GroundTruthStore for BTreeMap<(String, String), String> {
    fn get(&self, document_id: &str, field_key: &str) -> Option<String> {
        self.get(&(document_id.to_string(), field_key.to_string()))
            .cloned()
    }
}

/// Active prompt and version history per field.
#[async_trait]
pub trait PromptHistoryStore: Send + Sync {
    async fn current_prompt(
        &self,
        field_key: &str,
        template_key: &str,
    ) -> Result<Option<String>, ServiceError>;

    async fn save_version(
        &self,
        field_key: &str,
        prompt: &str,
        history: &[PromptAttempt],
        template_key: &str,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedPromptVersion {
    pub prompt: String,
    pub history: Vec<PromptAttempt>,
}

/// Prompt store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPromptStore {
    active: Arc<RwLock<HashMap<(String, String), String>>>,
    versions: Arc<RwLock<HashMap<(String, String), Vec<SavedPromptVersion>>>>,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(self, template_key: &str, field_key: &str, prompt: &str) -> Self {
        if let Ok(mut active) = self.active.write() {
            active.insert(
                (template_key.to_string(), field_key.to_string()),
                prompt.to_string(),
            );
        }
        self
    }

    pub fn versions(&self, template_key: &str, field_key: &str) -> Vec<SavedPromptVersion> {
        self.versions
            .read()
            .ok()
            .and_then(|v| {
                v.get(&(template_key.to_string(), field_key.to_string()))
                    .cloned()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PromptHistoryStore for InMemoryPromptStore {
    async fn current_prompt(
        &self,
        field_key: &str,
        template_key: &str,
    ) -> Result<Option<String>, ServiceError> {
        let active = self
            .active
            .read()
            .map_err(|e| ServiceError::Request(format!("prompt store poisoned: {}", e)))?;
        Ok(active
            .get(&(template_key.to_string(), field_key.to_string()))
            .cloned())
    }

    async fn save_version(
        &self,
        field_key: &str,
        prompt: &str,
        history: &[PromptAttempt],
        template_key: &str,
    ) -> Result<(), ServiceError> {
        let key = (template_key.to_string(), field_key.to_string());
        self.active
            .write()
            .map_err(|e| ServiceError::Request(format!("prompt store poisoned: {}", e)))?
            .insert(key.clone(), prompt.to_string());
        self.versions
            .write()
            .map_err(|e| ServiceError::Request(format!("prompt store poisoned: {}", e)))?
            .entry(key)
            .or_default()
            .push(SavedPromptVersion {
                prompt: prompt.to_string(),
                history: history.to_vec(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryPromptStore::new().with_prompt("invoice", "total", "Find the total.");
        assert_eq!(
            store.current_prompt("total", "invoice").await.unwrap(),
            Some("Find the total.".to_string())
        );
        assert_eq!(store.current_prompt("total", "receipt").await.unwrap(), None);

        store
            .save_version("total", "Find the grand total.", &[], "invoice")
            .await
            .unwrap();
        assert_eq!(
            store.current_prompt("total", "invoice").await.unwrap(),
            Some("Find the grand total.".to_string())
        );
        assert_eq!(store.versions("invoice", "total").len(), 1);
    }

    #[test]
    fn test_map_ground_truth_store() {
        let mut map = BTreeMap::new();
        map.insert(("doc1".to_string(), "total".to_string()), "10.00".to_string());
        assert_eq!(
            GroundTruthStore::get(&map, "doc1", "total"),
            Some("10.00".to_string())
        );
        assert_eq!(GroundTruthStore::get(&map, "doc2", "total"), None);
    }
}
