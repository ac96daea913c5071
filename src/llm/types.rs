use crate::services::ContextRef;
use serde::{Deserialize, Serialize};

/// A file held by the Gemini Files API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteDocument {
    pub uri: String,
    /// Resource name, e.g. `files/abc123`.
    pub name: String,
    pub display_name: String,
    pub mime_type: String,
    pub state: String,
}

impl RemoteDocument {
    pub fn context_ref(&self) -> ContextRef {
        ContextRef {
            id: self.name.clone(),
            uri: self.uri.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Files first, then the instruction text.
    pub fn user_with_files<'a>(
        text: impl Into<String>,
        files: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut parts: Vec<Part> = files
            .into_iter()
            .map(|(uri, mime_type)| Part::File {
                file_data: FileData {
                    mime_type: mime_type.to_string(),
                    file_uri: uri.to_string(),
                },
            })
            .collect();
        parts.push(Part::Text { text: text.into() });
        Self {
            role: "user".to_string(),
            parts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationConfig {
    pub fn json(schema: Option<serde_json::Value>) -> Self {
        Self {
            response_mime_type: Some("application/json".to_string()),
            response_schema: schema,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    pub content: Option<CandidateContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    pub fn text(&self) -> Option<String> {
        let parts = &self.candidates.as_ref()?.first()?.content.as_ref()?.parts;
        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::File { .. } => None,
            })
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = GenerateContentRequest {
            contents: vec![Content::user_with_files(
                "Compare",
                [("https://files/abc", "text/plain")],
            )],
            system_instruction: None,
            generation_config: GenerationConfig::json(None),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value["contents"][0]["parts"][0]["fileData"]["fileUri"],
            "https://files/abc"
        );
        assert_eq!(value["contents"][0]["parts"][1]["text"], "Compare");
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert!(value.get("systemInstruction").is_none());
    }

    #[test]
    fn test_response_text() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"MATCH\n"},{"text":"Reason: same"}]}}]}"#;
        let response: GenerateContentResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.text().as_deref(), Some("MATCH\nReason: same"));

        let empty: GenerateContentResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(empty.text().is_none());
    }
}
