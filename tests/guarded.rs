//! Guarded Generation Integration Tests
//!
//! Tests for the three-attempt structured-output escalation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use leadrun::adapters::{GenerationRequest, Generator, GeneratorError};
use leadrun::core::{GuardError, GuardedGenerator, GuardedRequest};
use serde_json::json;

/// Replays canned responses and records every request it sees
struct Scripted {
    responses: Mutex<VecDeque<Result<String, GeneratorError>>>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl Scripted {
    fn new(responses: Vec<Result<String, GeneratorError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<GenerationRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.seen.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GeneratorError::Request("script exhausted".to_string())))
    }

    async fn health_check(&self) -> Result<(), GeneratorError> {
        Ok(())
    }
}

fn persona_request() -> GuardedRequest {
    GuardedRequest {
        module: "persona-generation".to_string(),
        model: "gpt-4o".to_string(),
        prompt: "Describe the buyer.".to_string(),
        system_instruction: "You are an analyst.".to_string(),
        schema_hint: Some("{\"persona\": {...}}".to_string()),
        required_keys: vec!["persona.role".to_string(), "persona.goals".to_string()],
    }
}

#[tokio::test]
async fn test_first_valid_response_wins() {
    let script = Scripted::new(vec![Ok(
        r#"```json
{"persona": {"role": "Owner", "goals": ["grow"]}}
```"#
            .to_string(),
    )]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let result = guarded.generate(&persona_request()).await.unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(result.data["persona"]["role"], json!("Owner"));
    assert_eq!(script.seen().len(), 1);
}

#[tokio::test]
async fn test_missing_keys_escalate_to_repair() {
    let script = Scripted::new(vec![
        Ok(r#"{"persona": {"role": "Owner"}}"#.to_string()),
        Ok("I think the persona is an owner who wants growth.".to_string()),
        Ok(r#"{"persona": {"role": "Owner", "goals": ["grow"]}}"#.to_string()),
    ]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let result = guarded.generate(&persona_request()).await.unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.data["persona"]["goals"], json!(["grow"]));

    let seen = script.seen();
    assert_eq!(seen.len(), 3);

    // Attempt 1: the request as given
    assert_eq!(seen[0].prompt, "Describe the buyer.");
    assert_eq!(seen[0].model, "gpt-4o");

    // Attempt 2: same model, JSON-only directive appended
    assert!(seen[1].prompt.starts_with("Describe the buyer."));
    assert!(seen[1].prompt.contains("Return ONLY a single valid JSON object"));
    assert_eq!(seen[1].model, "gpt-4o");

    // Attempt 3: repair model, fed the keys and the previous raw output
    assert_eq!(seen[2].model, "gpt-4o-mini");
    assert!(seen[2].prompt.contains("persona.role, persona.goals"));
    assert!(seen[2].prompt.contains("an owner who wants growth"));
    assert!(seen[2].schema_hint.is_none());
}

#[tokio::test]
async fn test_exhaustion_reports_last_failure() {
    let script = Scripted::new(vec![
        Ok("{}".to_string()),
        Ok("{}".to_string()),
        Ok(r#"{"persona": {"role": null, "goals": []}}"#.to_string()),
    ]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let err = guarded.generate(&persona_request()).await.unwrap_err();
    match &err {
        GuardError::Exhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("Expected exhaustion, got {:?}", other),
    }

    let root = anyhow::Error::from(err).root_cause().to_string();
    assert_eq!(root, "Response is missing required keys: persona.role");
}

#[tokio::test]
async fn test_call_errors_count_as_attempts() {
    let script = Scripted::new(vec![
        Err(GeneratorError::Request("timeout".to_string())),
        Err(GeneratorError::Request("timeout".to_string())),
        Err(GeneratorError::Request("timeout".to_string())),
    ]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let err = guarded.generate(&persona_request()).await.unwrap_err();
    assert_eq!(script.seen().len(), 3);
    assert_eq!(anyhow::Error::from(err).root_cause().to_string(), "timeout");
}

#[tokio::test]
async fn test_configuration_error_is_not_retried() {
    let script = Scripted::new(vec![
        Err(GeneratorError::Configuration("no API key set".to_string())),
        Ok(r#"{"persona": {"role": "Owner", "goals": ["grow"]}}"#.to_string()),
    ]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let err = guarded.generate(&persona_request()).await.unwrap_err();
    assert!(matches!(err, GuardError::Configuration { .. }));
    assert_eq!(script.seen().len(), 1);
}

#[tokio::test]
async fn test_plain_generation_passes_through() {
    let script = Scripted::new(vec![Ok("# Package".to_string())]);
    let guarded = GuardedGenerator::new(script.clone(), "gpt-4o-mini");

    let request = GenerationRequest {
        module: "final-package-assembly".to_string(),
        model: "gpt-4o".to_string(),
        prompt: "Compile.".to_string(),
        system_instruction: "Markdown only.".to_string(),
        schema_hint: None,
    };

    assert_eq!(guarded.generate_plain(&request).await.unwrap(), "# Package");
    assert_eq!(script.seen(), vec![request]);
}
