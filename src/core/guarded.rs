//! Structured-output guard around the generative call.
//!
//! The model is asked for a JSON object but may wrap it in prose, fence it,
//! or leave keys out. Each call is escalated through up to three attempts:
//!
//! 1. the base request;
//! 2. the same request with a JSON-only directive;
//! 3. a repair request to the cheaper repair model, given only the required
//!    keys and the previous raw output.
//!
//! The first response that parses and carries every required key path wins.
//! Configuration errors are never retried.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::{GenerationRequest, Generator, GeneratorError};

/// Attempts made before giving up
pub const MAX_ATTEMPTS: u32 = 3;

const JSON_ONLY_DIRECTIVE: &str = "Return ONLY a single valid JSON object. \
Do not include explanations, markdown, or code fences.";

const REPAIR_INSTRUCTION: &str = "You repair malformed model output. \
Reply with one valid JSON object and nothing else.";

/// A structured generation request
#[derive(Debug, Clone)]
pub struct GuardedRequest {
    pub module: String,
    pub model: String,
    pub prompt: String,
    pub system_instruction: String,
    pub schema_hint: Option<String>,

    /// Dot-notation paths that must resolve to non-null values
    pub required_keys: Vec<String>,
}

/// A validated response
#[derive(Debug, Clone)]
pub struct Guarded {
    /// Parsed object
    pub data: Value,

    /// Raw model text it came from
    pub raw: String,

    /// 1-based attempt that produced it
    pub attempts: u32,
}

/// Why a single attempt was rejected
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Call(GeneratorError),

    #[error("Response did not contain a JSON object")]
    Parse,

    #[error("Response is missing required keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),
}

/// Errors from guarded generation
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("[{module}] generator configuration error")]
    Configuration {
        module: String,
        #[source]
        source: GeneratorError,
    },

    #[error("[{module}] no valid response after {attempts} attempts")]
    Exhausted {
        module: String,
        attempts: u32,
        #[source]
        source: AttemptFailure,
    },
}

/// Generator wrapper enforcing structured output
#[derive(Clone)]
pub struct GuardedGenerator {
    generator: Arc<dyn Generator>,
    repair_model: String,
}

impl GuardedGenerator {
    pub fn new(generator: Arc<dyn Generator>, repair_model: impl Into<String>) -> Self {
        Self {
            generator,
            repair_model: repair_model.into(),
        }
    }

    /// Unguarded pass-through for free-form content
    pub async fn generate_plain(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.generator.generate(request).await
    }

    fn build_call(&self, request: &GuardedRequest, attempt: u32, previous_raw: &str) -> GenerationRequest {
        match attempt {
            1 => GenerationRequest {
                module: request.module.clone(),
                model: request.model.clone(),
                prompt: request.prompt.clone(),
                system_instruction: request.system_instruction.clone(),
                schema_hint: request.schema_hint.clone(),
            },
            2 => GenerationRequest {
                module: request.module.clone(),
                model: request.model.clone(),
                prompt: format!("{}\n\n{}", request.prompt, JSON_ONLY_DIRECTIVE),
                system_instruction: request.system_instruction.clone(),
                schema_hint: request.schema_hint.clone(),
            },
            _ => GenerationRequest {
                module: request.module.clone(),
                model: self.repair_model.clone(),
                prompt: format!(
                    "Required keys: {}\n\nPrevious output:\n{}\n\nReturn a corrected JSON object that contains every required key.",
                    request.required_keys.join(", "),
                    previous_raw
                ),
                system_instruction: REPAIR_INSTRUCTION.to_string(),
                schema_hint: None,
            },
        }
    }

    /// Obtain a response that parses and carries every required key path
    pub async fn generate(&self, request: &GuardedRequest) -> Result<Guarded, GuardError> {
        let mut previous_raw = String::new();
        let mut last_failure = AttemptFailure::Parse;

        for attempt in 1..=MAX_ATTEMPTS {
            let call = self.build_call(request, attempt, &previous_raw);

            let raw = match self.generator.generate(&call).await {
                Ok(raw) => raw,
                Err(e) if e.is_configuration() => {
                    return Err(GuardError::Configuration {
                        module: request.module.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(module = %request.module, attempt, error = %e, "Generation call failed");
                    last_failure = AttemptFailure::Call(e);
                    continue;
                }
            };

            match validate(&raw, &request.required_keys) {
                Ok(data) => {
                    debug!(module = %request.module, attempt, "Structured output accepted");
                    return Ok(Guarded {
                        data,
                        raw,
                        attempts: attempt,
                    });
                }
                Err(failure) => {
                    warn!(module = %request.module, attempt, error = %failure, "Structured output rejected");
                    previous_raw = raw;
                    last_failure = failure;
                }
            }
        }

        Err(GuardError::Exhausted {
            module: request.module.clone(),
            attempts: MAX_ATTEMPTS,
            source: last_failure,
        })
    }
}

/// Parse raw text and check every required path
pub fn validate(raw: &str, required_keys: &[String]) -> Result<Value, AttemptFailure> {
    let data = extract_json_object(raw).ok_or(AttemptFailure::Parse)?;
    let missing = missing_keys(&data, required_keys);
    if missing.is_empty() {
        Ok(data)
    } else {
        Err(AttemptFailure::MissingKeys(missing))
    }
}

/// Pull a JSON object out of model text
///
/// Prefers the contents of a fenced code block, then the span from the first
/// `{` to the last `}`.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    let mut candidates = Vec::new();
    if let Some(fenced) = fenced_block(trimmed) {
        candidates.push(fenced);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    candidates
        .into_iter()
        .filter_map(|c| serde_json::from_str::<Value>(c).ok())
        .find(Value::is_object)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip an optional language tag such as `json`
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Resolve a dot-notation path; numeric segments index arrays
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Required paths that are absent or null
pub fn missing_keys(value: &Value, required_keys: &[String]) -> Vec<String> {
    required_keys
        .iter()
        .filter(|path| !matches!(resolve_path(value, path), Some(v) if !v.is_null()))
        .cloned()
        .collect()
}
