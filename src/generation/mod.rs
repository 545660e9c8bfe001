pub mod claude;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::schema::Schema;
use crate::pipeline::state::StageId;
use crate::tools::ToolSet;

/// Provider-neutral description of a tool offered to the generation capability.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One structured-generation call on behalf of a stage.
#[derive(Debug)]
pub struct GenerationRequest<'a> {
    pub stage: StageId,
    pub system: &'a str,
    pub prompt: String,
    pub schema: &'a Schema,
}

/// Unvalidated text returned by the capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl RawOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("generation timed out")]
    Timeout,

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no final answer after {0} turns")]
    TurnLimit(u32),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl GenerationError {
    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Client errors (bad request, bad credentials) will not change on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GenerationError::Api { status, .. } if (400..500).contains(status))
    }
}

/// Façade over a remote text/structured-generation capability.
///
/// Transport concurrency is private to implementations; callers see one
/// awaited call per generation.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
        tools: &ToolSet<'_>,
    ) -> Result<RawOutput, GenerationError>;
}
