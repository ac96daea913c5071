//! Prompt synthesis: asks a generation model for a better extraction prompt
//! and turns its reply into a usable prompt, falling back to a fixed
//! template when the reply is unusable.

use crate::config::{ModelCatalog, OptimizerConfig};
use crate::error::{OptimizerError, Result, ServiceError};
use crate::judge::{generate_with_placeholder, PlaceholderContextCache};
use crate::prompts::{FALLBACK_REASONING_PREFIX, SYSTEM_PROMPT_SYNTHESIS};
use crate::schema::{FailureExample, FieldDefinition, FieldType, PromptAttempt};
use crate::services::ModelService;
use crate::utils::{clean_json_output, strip_code_fences, truncate_for_prompt, KeyRule};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Where the new prompt may appear in a reply, in priority order.
const NEW_PROMPT_KEYS: KeyRule = KeyRule::new(&[
    "new_prompt",
    "newPrompt",
    "prompt",
    "improved_prompt",
    "revised_prompt",
]);
const REASONING_KEYS: KeyRule = KeyRule::new(&["reasoning", "rationale", "explanation"]);

const NO_REASONING: &str = "no reasoning provided";
const MAX_EXAMPLES: usize = 10;
const MAX_EXAMPLE_CHARS: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct PromptSuggestion {
    #[schemars(description = "The complete revised extraction prompt for this field.")]
    pub new_prompt: String,

    #[schemars(description = "One or two sentences describing what changed and why.")]
    pub reasoning: String,

    /// Set when `new_prompt` is the built-in fallback rather than model output.
    #[serde(skip)]
    pub is_fallback: bool,
}

impl PromptSuggestion {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PromptSuggestion)
    }

    pub fn schema_as_json() -> serde_json::Result<String> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }

    /// The schema without the `$schema` and `title` keys, which Gemini rejects.
    pub fn response_schema() -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(Self::generate_json_schema())?;
        if let Some(object) = value.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }
        Ok(value)
    }
}

/// Evidence for one synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesisRequest<'a> {
    pub field: &'a FieldDefinition,
    pub current_prompt: &'a str,
    pub current_accuracy: f64,
    /// Oldest first. Only the most recent few are shown to the model.
    pub previous_attempts: &'a [PromptAttempt],
    pub failures: &'a [FailureExample],
    pub successes: &'a [FailureExample],
    pub iteration: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub max_previous_attempts: usize,
    pub min_prompt_length: usize,
    pub not_present_marker: String,
    pub document_type_hint: Option<String>,
    pub custom_instructions: Option<String>,
}

impl SynthesisOptions {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            max_previous_attempts: config.max_previous_attempts,
            min_prompt_length: config.min_prompt_length,
            not_present_marker: config.not_present_marker.clone(),
            document_type_hint: config.document_type_hint.clone(),
            custom_instructions: config.custom_instructions.clone(),
        }
    }
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self::from_config(&OptimizerConfig::default())
    }
}

pub fn build_synthesis_prompt(
    request: &SynthesisRequest<'_>,
    options: &SynthesisOptions,
    catalog: &ModelCatalog,
) -> String {
    let field = request.field;
    let mut out = String::from(SYSTEM_PROMPT_SYNTHESIS.trim());

    let _ = write!(
        out,
        "\n\n## FIELD\nName: {}\nKey: {}\nType: {}\nNot-present marker: {}\n",
        field.name,
        field.key,
        field.field_type.as_str(),
        options.not_present_marker
    );
    if !field.enum_values.is_empty() {
        let _ = writeln!(out, "Allowed values: {}", field.enum_values.join(", "));
    }
    if let Some(heuristic) = catalog.heuristic_for(&field.name) {
        let _ = writeln!(out, "Type guidance: {}", heuristic.guidance);
    }

    if let Some(hint) = options.document_type_hint.as_deref().filter(|h| !h.trim().is_empty()) {
        let _ = write!(out, "\n## DOCUMENT TYPE\n{}\n", hint.trim());
    }

    let _ = write!(
        out,
        "\n## PROGRESS\nIteration {} of {}. Current accuracy on the sampled documents: {:.0}%.\n",
        request.iteration,
        request.max_iterations,
        request.current_accuracy * 100.0
    );

    let _ = write!(out, "\n## CURRENT PROMPT\n{}\n", request.current_prompt.trim());

    let skip = request
        .previous_attempts
        .len()
        .saturating_sub(options.max_previous_attempts);
    let previous = &request.previous_attempts[skip..];
    if !previous.is_empty() {
        out.push_str("\n## PREVIOUS ATTEMPTS\n");
        for attempt in previous {
            let _ = writeln!(
                out,
                "- Iteration {} ({:.0}%): {}",
                attempt.iteration,
                attempt.accuracy * 100.0,
                truncate_for_prompt(attempt.prompt.trim(), MAX_EXAMPLE_CHARS)
            );
        }
    }

    out.push_str("\n## FAILURES\n");
    if request.failures.is_empty() {
        out.push_str("(none recorded)\n");
    }
    write_examples(&mut out, request.failures);

    if !request.successes.is_empty() {
        out.push_str("\n## SUCCESSES\n");
        write_examples(&mut out, request.successes);
    }

    if let Some(extra) = options.custom_instructions.as_deref().filter(|c| !c.trim().is_empty()) {
        let _ = write!(out, "\n## ADDITIONAL INSTRUCTIONS\n{}\n", extra.trim());
    }

    out
}

fn write_examples(out: &mut String, examples: &[FailureExample]) {
    for example in examples.iter().take(MAX_EXAMPLES) {
        let _ = writeln!(
            out,
            "- Document {}: returned \"{}\", expected \"{}\"",
            example.document_id,
            truncate_for_prompt(&example.predicted, MAX_EXAMPLE_CHARS),
            truncate_for_prompt(&example.expected, MAX_EXAMPLE_CHARS)
        );
    }
    if examples.len() > MAX_EXAMPLES {
        let _ = writeln!(out, "- ... and {} more", examples.len() - MAX_EXAMPLES);
    }
}

/// Reads a synthesis reply.
///
/// Malformed, empty or too-short replies yield the fallback prompt. The only
/// error is a blank field name, since no fallback can be built without it.
pub fn parse_synthesis_response(
    raw: &str,
    field: &FieldDefinition,
    options: &SynthesisOptions,
) -> Result<PromptSuggestion> {
    if field.name.trim().is_empty() {
        return Err(OptimizerError::MissingFieldName);
    }

    let decoded = serde_json::from_str::<Value>(strip_code_fences(raw))
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&clean_json_output(raw)).ok());
    let Some(value) = decoded else {
        return Ok(fallback_suggestion(field, options, "the reply was not valid JSON"));
    };
    let Some(candidate) = NEW_PROMPT_KEYS.resolve(&value) else {
        return Ok(fallback_suggestion(field, options, "the reply contained no new prompt"));
    };

    let candidate = candidate.trim();
    if candidate.chars().count() < options.min_prompt_length {
        let reason = format!(
            "the proposed prompt was shorter than {} characters",
            options.min_prompt_length
        );
        return Ok(fallback_suggestion(field, options, &reason));
    }

    let reasoning = REASONING_KEYS
        .resolve(&value)
        .map(str::trim)
        .unwrap_or(NO_REASONING);

    Ok(PromptSuggestion {
        new_prompt: candidate.to_string(),
        reasoning: reasoning.to_string(),
        is_fallback: false,
    })
}

/// Fixed extraction instruction built from the field's name and type.
pub fn fallback_prompt(field: &FieldDefinition, not_present_marker: &str) -> String {
    let name = field.name.trim();
    let mut prompt = format!(
        "Extract the {} from the document. Return only the value exactly as it is written in the document, \
         with no labels, explanations or extra formatting.",
        name
    );
    let type_rule = match field.field_type {
        FieldType::Date => Some("Write dates as YYYY-MM-DD.".to_string()),
        FieldType::Number | FieldType::Currency => {
            Some("If several amounts appear, return the one that answers this field directly.".to_string())
        }
        FieldType::Boolean => Some("Answer Yes or No.".to_string()),
        FieldType::Enum if !field.enum_values.is_empty() => Some(format!(
            "Answer with exactly one of: {}.",
            field.enum_values.join(", ")
        )),
        FieldType::List => Some("Separate multiple values with a semicolon.".to_string()),
        _ => None,
    };
    if let Some(rule) = type_rule {
        prompt.push(' ');
        prompt.push_str(&rule);
    }
    let _ = write!(
        prompt,
        " If the document does not contain the {}, return {}.",
        name, not_present_marker
    );
    prompt
}

fn fallback_suggestion(field: &FieldDefinition, options: &SynthesisOptions, reason: &str) -> PromptSuggestion {
    warn!("Synthesis for '{}' fell back to the default prompt: {}", field.key, reason);
    PromptSuggestion {
        new_prompt: fallback_prompt(field, &options.not_present_marker),
        reasoning: format!("{}: {}.", FALLBACK_REASONING_PREFIX, reason),
        is_fallback: true,
    }
}

/// Calls the generation model for revised prompts.
#[derive(Clone)]
pub struct PromptSynthesizer {
    service: Arc<dyn ModelService>,
    contexts: Arc<PlaceholderContextCache>,
    catalog: Arc<ModelCatalog>,
    model: String,
    timeout: Duration,
    attempts: u32,
    options: SynthesisOptions,
}

impl PromptSynthesizer {
    pub fn new(service: Arc<dyn ModelService>, catalog: Arc<ModelCatalog>, config: &OptimizerConfig) -> Self {
        Self {
            service,
            contexts: Arc::new(PlaceholderContextCache::new()),
            catalog,
            model: config.generation_model.clone(),
            timeout: config.call_timeout(),
            attempts: config.synthesis_attempts,
            options: SynthesisOptions::from_config(config),
        }
    }

    pub fn with_context_cache(mut self, contexts: Arc<PlaceholderContextCache>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn options(&self) -> &SynthesisOptions {
        &self.options
    }

    /// Retries failed calls up to the configured attempt count. A reply that
    /// arrives is never retried: unusable replies become the fallback.
    pub async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<PromptSuggestion> {
        let prompt = build_synthesis_prompt(request, &self.options, &self.catalog);
        let attempts = self.attempts.max(1);
        let mut last_error: Option<ServiceError> = None;

        for attempt in 1..=attempts {
            debug!(
                "Synthesizing prompt for '{}' (iteration {}, attempt {}/{})",
                request.field.key, request.iteration, attempt, attempts
            );
            match generate_with_placeholder(
                self.service.as_ref(),
                &self.contexts,
                &self.model,
                &prompt,
                self.timeout,
            )
            .await
            {
                Ok(raw) => {
                    let suggestion = parse_synthesis_response(&raw, request.field, &self.options)?;
                    if !suggestion.is_fallback {
                        info!("New prompt for '{}': {}", request.field.key, suggestion.reasoning);
                    }
                    return Ok(suggestion);
                }
                Err(err) => {
                    warn!(
                        "Synthesis attempt {}/{} for '{}' failed: {}",
                        attempt, attempts, request.field.key, err
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(OptimizerError::Service(last_error.unwrap_or_else(|| {
            ServiceError::Request("no synthesis attempt was made".to_string())
        })))
    }
}
