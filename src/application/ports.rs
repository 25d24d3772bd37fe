//! External services consumed by the library: the math engine and the
//! narrative generator.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{EngineConfig, GeometryPayload, NormalizedInput};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("geometry engine unreachable: {0}")]
    Unavailable(String),
    #[error("geometry engine rejected input ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("geometry engine returned an unreadable payload: {0}")]
    InvalidPayload(String),
}

/// Deterministic, side-effect free geometry computation.
#[async_trait]
pub trait GeometryEngine: Send + Sync {
    async fn compute(
        &self,
        input: &NormalizedInput,
        engine: &EngineConfig,
    ) -> Result<GeometryPayload, EngineError>;
}

/// A structured prompt ready for the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Generation {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation transport failed: {0}")]
    Transport(String),
    #[error("generation service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation response was malformed: {0}")]
    Malformed(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

/// Non-deterministic, metered text generation.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, prompt: &PromptPayload) -> Result<Generation, GenerationError>;
}
