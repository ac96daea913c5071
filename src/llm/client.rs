use crate::error::ServiceError;
use crate::llm::types::*;
use crate::services::{ContextRef, ModelService};
use crate::synthesis::PromptSuggestion;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";

const PLACEHOLDER_NAME: &str = "placeholder-context.txt";
const PLACEHOLDER_BODY: &str = "This file intentionally left blank.";
pub const PLACEHOLDER_MIME: &str = "text/plain";
const MAX_STATE_POLLS: usize = 30;

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    upload_url: String,
    response_schema: Option<serde_json::Value>,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            upload_url: GEMINI_UPLOAD_URL.to_string(),
            response_schema: None,
        }
    }

    /// Points both the REST and the upload endpoints at another host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        self.upload_url = format!("{}/upload/files", base_url);
        self.base_url = base_url;
        self
    }

    /// Requests JSON output matching `schema` from every `generate` call.
    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// A copy whose replies follow the [`PromptSuggestion`] schema.
    pub fn for_prompt_synthesis(&self) -> serde_json::Result<Self> {
        Ok(self
            .clone()
            .with_response_schema(PromptSuggestion::response_schema()?))
    }

    pub async fn upload_text(
        &self,
        display_name: &str,
        body: &str,
        mime_type: &str,
    ) -> Result<RemoteDocument, ServiceError> {
        self.upload_bytes(display_name, body.as_bytes().to_vec(), mime_type)
            .await
    }

    /// Uploads a file body through the resumable upload protocol and waits
    /// until Google reports it ACTIVE.
    pub async fn upload_bytes(
        &self,
        display_name: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<RemoteDocument, ServiceError> {
        let start_url = format!("{}?key={}", self.upload_url, self.api_key);
        let metadata = json!({ "file": { "display_name": display_name } });

        let init_res = self
            .client
            .post(&start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .header("Content-Type", "application/json")
            .json(&metadata)
            .send()
            .await?;

        let init_status = init_res.status();
        if !init_status.is_success() {
            let error_text = init_res.text().await?;
            return Err(status_error("Upload init failed", init_status, error_text));
        }

        let upload_url = init_res
            .headers()
            .get("x-goog-upload-url")
            .ok_or_else(|| ServiceError::InvalidResponse("No upload URL in headers".to_string()))?
            .to_str()
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?
            .to_string();

        let upload_res = self
            .client
            .post(&upload_url)
            .header("Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .await?;

        let upload_status = upload_res.status();
        if !upload_status.is_success() {
            let error_text = upload_res.text().await?;
            return Err(status_error("File upload failed", upload_status, error_text));
        }

        let upload_body: serde_json::Value = upload_res.json().await?;
        let file_obj = upload_body
            .get("file")
            .ok_or_else(|| ServiceError::InvalidResponse("Upload response missing 'file'".to_string()))?;

        let uri = required_str(file_obj, "uri")?;
        let name = required_str(file_obj, "name")?;
        let state = file_obj
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("PROCESSING")
            .to_string();

        let state = if state == "ACTIVE" {
            state
        } else {
            self.wait_until_active(&name).await?
        };

        Ok(RemoteDocument {
            uri,
            name,
            display_name: display_name.to_string(),
            mime_type: mime_type.to_string(),
            state,
        })
    }

    async fn wait_until_active(&self, name: &str) -> Result<String, ServiceError> {
        for _ in 0..MAX_STATE_POLLS {
            let check_url = format!("{}/{}?key={}", self.base_url, name, self.api_key);
            let check_res = self.client.get(&check_url).send().await?;
            let status = check_res.status();
            if !status.is_success() {
                let error_text = check_res.text().await?;
                return Err(status_error("File state check failed", status, error_text));
            }
            let check_json: serde_json::Value = check_res.json().await?;
            let file_obj = check_json.get("file").unwrap_or(&check_json);
            match file_obj.get("state").and_then(|v| v.as_str()) {
                Some("ACTIVE") => return Ok("ACTIVE".to_string()),
                Some("FAILED") => {
                    return Err(ServiceError::Request(format!(
                        "Google failed to process {}",
                        name
                    )))
                }
                _ => sleep(Duration::from_secs(2)).await,
            }
        }
        Err(ServiceError::Request(format!("{} never became ACTIVE", name)))
    }

    pub(crate) async fn generate_content(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        contents: Vec<Content>,
        generation_config: GenerationConfig,
    ) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents,
            system_instruction: system_prompt.map(Content::user),
            generation_config,
        };

        let res = self.client.post(&url).json(&payload).send().await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(status_error("Gemini API Error", status, err_text));
        }

        let body: GenerateContentResponse = res.json().await?;
        body.text()
            .ok_or_else(|| ServiceError::InvalidResponse("No text candidates returned".to_string()))
    }
}

#[async_trait]
impl ModelService for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        contexts: &[ContextRef],
    ) -> Result<String, ServiceError> {
        let content = Content::user_with_files(
            prompt,
            contexts.iter().map(|c| (c.uri.as_str(), PLACEHOLDER_MIME)),
        );
        let config = match &self.response_schema {
            Some(schema) => GenerationConfig::json(Some(schema.clone())),
            None => GenerationConfig::default(),
        };
        self.generate_content(model, None, vec![content], config).await
    }

    async fn create_placeholder_context(&self) -> Result<ContextRef, ServiceError> {
        let document = self
            .upload_text(PLACEHOLDER_NAME, PLACEHOLDER_BODY, PLACEHOLDER_MIME)
            .await?;
        debug!("Uploaded placeholder context {}", document.name);
        Ok(document.context_ref())
    }
}

/// A 404 means a referenced file or model is gone; the judge recovers from that.
fn status_error(context: &str, status: StatusCode, body: String) -> ServiceError {
    let message = format!("{} (status {}): {}", context, status, body);
    if status == StatusCode::NOT_FOUND {
        ServiceError::NotFound(message)
    } else {
        ServiceError::Request(message)
    }
}

fn required_str(object: &serde_json::Value, key: &str) -> Result<String, ServiceError> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::InvalidResponse(format!("Upload response missing {}", key)))
}
