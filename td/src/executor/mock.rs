//! A deterministic test double: returns a fixed sequence of results in
//! call order, erroring once exhausted, so tests can assert exactly how
//! many times the worker invoked the executor.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ExecutorError;

use super::{Executor, ExecutorRequest, ExecutorResult};

pub struct MockExecutor {
    results: Vec<Result<ExecutorResult, ExecutorError>>,
    call_count: AtomicUsize,
}

impl MockExecutor {
    pub fn new(results: Vec<Result<ExecutorResult, ExecutorError>>) -> Self {
        debug!(result_count = results.len(), "MockExecutor::new: called");
        Self {
            results,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorResult, ExecutorError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %request.task_id, idx, "MockExecutor::execute: called");
        match self.results.get(idx) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(err)) => Err(clone_error(err)),
            None => Err(ExecutorError::InvalidResponse("no more mock results".to_string())),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// `ExecutorError` doesn't derive `Clone` (it wraps non-`Clone` error
/// text fields only, so this is a lossless manual clone).
fn clone_error(err: &ExecutorError) -> ExecutorError {
    match err {
        ExecutorError::RateLimited { retry_after_secs } => ExecutorError::RateLimited { retry_after_secs: *retry_after_secs },
        ExecutorError::ApiError { status, message } => ExecutorError::ApiError { status: *status, message: message.clone() },
        ExecutorError::Network(m) => ExecutorError::Network(m.clone()),
        ExecutorError::InvalidResponse(m) => ExecutorError::InvalidResponse(m.clone()),
        ExecutorError::Timeout(ms) => ExecutorError::Timeout(*ms),
        ExecutorError::MissingApiKey(m) => ExecutorError::MissingApiKey(m.clone()),
        ExecutorError::ResourceLimit(m) => ExecutorError::ResourceLimit(m.clone()),
        ExecutorError::Cancelled => ExecutorError::Cancelled,
    }
}
