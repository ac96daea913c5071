use crate::config::DEFAULT_NOT_PRESENT_MARKER;
use crate::error::ServiceError;
use crate::llm::client::GeminiClient;
use crate::llm::types::*;
use crate::prompts::SYSTEM_PROMPT_EXTRACTION;
use crate::services::{ExtractionRequest, ExtractionService};
use crate::utils::clean_json_output;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Extracts fields from uploaded documents with a single Gemini call per document.
pub struct GeminiExtractionService {
    client: GeminiClient,
    documents: HashMap<String, RemoteDocument>,
    system_prompt: String,
    not_present_marker: String,
}

impl GeminiExtractionService {
    pub fn new(client: GeminiClient) -> Self {
        Self {
            client,
            documents: HashMap::new(),
            system_prompt: SYSTEM_PROMPT_EXTRACTION.trim().to_string(),
            not_present_marker: DEFAULT_NOT_PRESENT_MARKER.to_string(),
        }
    }

    /// Registers the uploaded file behind a document id.
    pub fn with_document(mut self, document_id: impl Into<String>, document: RemoteDocument) -> Self {
        self.documents.insert(document_id.into(), document);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_not_present_marker(mut self, marker: impl Into<String>) -> Self {
        self.not_present_marker = marker.into();
        self
    }

    fn instructions(&self, request: &ExtractionRequest) -> String {
        let mut text = format!(
            "Not-present marker: {}\n\n### FIELDS\n",
            self.not_present_marker
        );
        for field in &request.fields {
            text.push_str(&format!(
                "- `{}` ({}, {}): {}\n",
                field.key,
                field.name,
                field.field_type.as_str(),
                field.prompt.trim()
            ));
        }
        text
    }

    /// A per-field override wins over the service default; the first one found is used.
    fn system_prompt_for<'a>(&'a self, request: &'a ExtractionRequest) -> &'a str {
        request
            .fields
            .iter()
            .find_map(|f| f.system_prompt.as_deref())
            .unwrap_or(self.system_prompt.as_str())
    }
}

fn response_schema(request: &ExtractionRequest) -> Value {
    let properties: serde_json::Map<String, Value> = request
        .fields
        .iter()
        .map(|f| (f.key.clone(), json!({ "type": "string" })))
        .collect();
    let required: Vec<&str> = request.fields.iter().map(|f| f.key.as_str()).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Reads the model's JSON object into a value per requested field.
///
/// Missing keys and nulls become the not-present marker; numbers and booleans
/// are rendered as text.
pub fn parse_extraction_response(
    raw: &str,
    request: &ExtractionRequest,
    not_present_marker: &str,
) -> Result<BTreeMap<String, String>, ServiceError> {
    let value: Value = serde_json::from_str(&clean_json_output(raw))
        .map_err(|e| ServiceError::InvalidResponse(format!("Extraction JSON parse failed: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| ServiceError::InvalidResponse("Extraction reply is not a JSON object".to_string()))?;

    Ok(request
        .fields
        .iter()
        .map(|field| {
            let text = match object.get(&field.key) {
                None | Some(Value::Null) => not_present_marker.to_string(),
                Some(Value::String(s)) => s.trim().to_string(),
                Some(other) => other.to_string(),
            };
            (field.key.clone(), text)
        })
        .collect())
}

#[async_trait]
impl ExtractionService for GeminiExtractionService {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let document = self.documents.get(&request.document_id).ok_or_else(|| {
            ServiceError::NotFound(format!("No uploaded file for document {}", request.document_id))
        })?;

        debug!(
            "Extracting {} field(s) from {} with {}",
            request.fields.len(),
            document.display_name,
            request.model
        );

        let content = Content::user_with_files(
            self.instructions(request),
            [(document.uri.as_str(), document.mime_type.as_str())],
        );
        let raw = self
            .client
            .generate_content(
                &request.model,
                Some(self.system_prompt_for(request)),
                vec![content],
                GenerationConfig::json(Some(response_schema(request))),
            )
            .await?;

        parse_extraction_response(&raw, request, &self.not_present_marker)
    }
}
