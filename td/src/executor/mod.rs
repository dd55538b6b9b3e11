//! The Executor contract: the boundary between the worker and
//! whatever actually runs a prompt (a live LLM client, a local stub,
//! or a deterministic mock).

pub mod anthropic;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::domain::QaGateResult;
use crate::error::ExecutorError;

/// Everything the worker hands to an executor for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    pub prompt: String,
    pub task_id: String,
    pub session_id: String,
    pub run_id: String,
    pub model: String,
    pub max_duration_ms: u64,
    pub cancel: CancelToken,
}

/// The worker's interpretation of an executor's outcome, before the
/// Guard's BLOCKED-promotion rule and the CompletionProtocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusHint {
    Complete,
    AwaitingResponse,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutorResult {
    pub output: String,
    pub status_hint: StatusHint,
    pub files_modified: Vec<String>,
    pub structured_error: Option<String>,
    pub gates: Vec<QaGateResult>,
    pub duration_ms: u64,
    pub token_usage: Option<TokenUsage>,
}

/// Runs one prompt and reports what happened. Implementations must
/// never forge evidence: a stub that never actually called a model
/// must not claim `success = true` evidence upstream.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorResult, ExecutorError>;

    /// Human-readable provider/model label for logging and evidence.
    fn name(&self) -> &str;
}
