//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface for the generative model that
//! drives each pipeline step. The orchestrator only ever sees raw text or a
//! distinguished configuration error.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

// Re-export the HTTP generator
pub use http::{HttpGenerator, HttpGeneratorConfig};

/// One request to the generative model
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Pipeline module issuing the call (used for logging and errors)
    pub module: String,

    /// Model identifier
    pub model: String,

    /// User prompt
    pub prompt: String,

    /// System instruction
    pub system_instruction: String,

    /// Description of the expected output shape, if any
    pub schema_hint: Option<String>,
}

/// Errors from the generative call boundary
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Missing or rejected credentials; retrying cannot help
    #[error("Generator is not configured: {0}")]
    Configuration(String),

    /// The call itself failed (transport, timeout, server error)
    #[error("{0}")]
    Request(String),
}

impl GeneratorError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Trait for generative model backends
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable generator name
    fn name(&self) -> &str;

    /// Run one generation and return the raw text
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError>;

    /// Verify credentials and reachability
    async fn health_check(&self) -> Result<(), GeneratorError>;
}
