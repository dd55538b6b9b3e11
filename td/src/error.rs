//! Component-level error types.
//!
//! Each error enum classifies its own retry/fatal behaviour where
//! callers need it, mirroring the split between `thiserror`-derived
//! leaf errors and `eyre::Result` at the daemon boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace must not be empty")]
    Empty,
    #[error("namespace '{0}' exceeds 32 characters")]
    TooLong(String),
    #[error("namespace '{0}' must start and end with an alphanumeric character and contain only alphanumerics or hyphens")]
    InvalidFormat(String),
    #[error("namespace '{0}' is reserved")]
    Reserved(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("cannot transition task {task_id} from terminal status {from} to {to}")]
    TerminalRegression { task_id: String, from: String, to: String },
    #[error("queue actor channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Store(#[from] taskstore::StoreError),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("api error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("api key not configured: {0}")]
    MissingApiKey(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Transient failures are retried under the worker's backoff policy;
    /// everything else is fatal and maps straight to ERROR.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::RateLimited { .. } => true,
            ExecutorError::ApiError { status, .. } => *status >= 500,
            ExecutorError::Network(_) => true,
            ExecutorError::Timeout(_) => true,
            ExecutorError::InvalidResponse(_) => false,
            ExecutorError::MissingApiKey(_) => false,
            ExecutorError::ResourceLimit(_) => false,
            ExecutorError::Cancelled => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ExecutorError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("evidence directory not writable: {0}")]
    NotWritable(String),
    #[error("integrity hash mismatch for call {0}")]
    IntegrityMismatch(String),
    #[error("evidence not found for call {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("stale run: gates carry mixed run ids {0:?}")]
    MixedRunIds(Vec<String>),
    #[error("stale run: gate run id '{gate_run_id}' does not match bound run id '{bound_run_id}'")]
    StaleRun { gate_run_id: String, bound_run_id: String },
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("user input must not be empty")]
    EmptyUserInput,
    #[error("template render error: {0}")]
    Render(String),
    #[error("io error reading template: {0}")]
    Io(#[from] std::io::Error),
}
