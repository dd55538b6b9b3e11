//! `TaskWorker`: one background loop per namespace, draining QUEUED
//! tasks without ever blocking submission.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::completion::{CompletionProtocol, EvidenceRecorder, GateFailure};
use crate::config::{ParallelLimits, RetryConfig, TaskLimits};
use crate::domain::{self, LlmEvidence, ProgressEvent, ProgressKind, QaGateResult, TaskRecord, TaskStatus, TaskType, new_run_id};
use crate::error::ExecutorError;
use crate::executor::{Executor, ExecutorRequest, StatusHint};
use crate::guard;
use crate::prompts::{PromptAssembler, TaskGroupContext, TemplateContext};
use crate::queue::QueueStore;

/// Phrases that mark an LLM response as still waiting on the caller,
/// used by the READ_INFO/REPORT synthesised gate.
const OUTSTANDING_QUESTION_MARKERS: &[&str] = &[
    "could you clarify",
    "can you clarify",
    "need more information",
    "please clarify",
    "which file did you mean",
    "i'm not sure what you mean",
];

fn has_outstanding_question(output: &str) -> bool {
    let lower = output.to_lowercase();
    OUTSTANDING_QUESTION_MARKERS.iter().any(|m| lower.contains(m))
}

pub struct TaskWorker {
    namespace: String,
    queue: QueueStore,
    executor: Arc<dyn Executor>,
    assembler: PromptAssembler,
    evidence_dir: std::path::PathBuf,
    api_key_present: bool,
    model: String,
    task_limits: TaskLimits,
    retry: RetryConfig,
    /// Bounds concurrent executor invocations to `parallel_limits.executors`
    /// (§4.3/§7), shared across every `TaskWorker` in the process since the
    /// cap is process-wide, not per-namespace — see
    /// `executor_permits_for`. `subagents` has no enforcement surface in
    /// this implementation — see DESIGN.md.
    executor_permits: Arc<Semaphore>,
}

/// Builds the process-wide executor concurrency permit, sized from
/// `parallel_limits.executors` (clamped to 1-4). Callers share one
/// `Arc` across every `TaskWorker` they construct so the cap holds
/// across namespaces, per §5's "parallel workers ... multiple
/// namespaces run in parallel" alongside §4.3/§7's `executors ≤ 4`.
pub fn executor_permits_for(parallel_limits: &ParallelLimits) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(parallel_limits.clamped().executors as usize))
}

impl TaskWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: impl Into<String>,
        queue: QueueStore,
        executor: Arc<dyn Executor>,
        assembler: PromptAssembler,
        evidence_dir: std::path::PathBuf,
        api_key_present: bool,
        model: impl Into<String>,
        task_limits: TaskLimits,
        retry: RetryConfig,
        executor_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            queue,
            executor,
            assembler,
            evidence_dir,
            api_key_present,
            model: model.into(),
            task_limits: task_limits.clamped(),
            retry,
            executor_permits,
        }
    }

    /// Spawn the worker's loop as its own tokio task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(namespace = %self.namespace, "TaskWorker::run: started");
        let mut events = self.queue.subscribe_events();
        loop {
            loop {
                let queued = match self.queue.list_by_status(TaskStatus::Queued).await {
                    Ok(tasks) => tasks,
                    Err(err) => {
                        warn!(namespace = %self.namespace, %err, "TaskWorker::run: failed to list queued tasks");
                        break;
                    }
                };
                let Some(task) = queued.into_iter().next() else { break };
                self.process_task(task).await;
            }

            match events.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(namespace = %self.namespace, skipped = n, "TaskWorker::run: event receiver lagged, rescanning");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!(namespace = %self.namespace, "TaskWorker::run: stopped");
    }

    /// Enforces `task_limits.seconds` as a hard ceiling over every
    /// retry attempt combined; breach cancels the executor and marks
    /// the task INCOMPLETE.
    async fn process_task(&self, task: TaskRecord) {
        let task_id = task.task_id.clone();
        info!(%task_id, "TaskWorker::process_task: started");
        let cancel = CancelToken::new();
        let overall_budget = Duration::from_secs(self.task_limits.seconds);

        let cancel_for_timeout = cancel.clone();
        let task_id_for_timeout = task_id.clone();
        let outcome = tokio::time::timeout(overall_budget, self.run_pipeline(task, cancel)).await;
        if outcome.is_err() {
            warn!(task_id = %task_id_for_timeout, "TaskWorker::process_task: task_limits.seconds exceeded, cancelling executor");
            cancel_for_timeout.cancel();
            let _ = self.queue.update_status(&task_id_for_timeout, TaskStatus::Incomplete).await;
            let _ = self
                .queue
                .append_event(
                    &task_id_for_timeout,
                    ProgressEvent::new(ProgressKind::LogChunk, serde_json::json!({"reason": "task_limits.seconds exceeded"})),
                )
                .await;
        }
    }

    async fn run_pipeline(&self, mut task: TaskRecord, cancel: CancelToken) {
        let task_id = task.task_id.clone();

        // Step 1: classify.
        let task_type = domain::detect_task_type(&task.prompt);
        debug!(%task_id, ?task_type, "TaskWorker::run_pipeline: classified");

        // Step 2: task-group context. Ambient scope: built from this
        // record's own history since no separate conversation store
        // exists yet.
        let group_context = TaskGroupContext {
            group_id: task.thread_id.clone(),
            working_files: task.files_modified.clone(),
            last_task_result: task.error.as_ref().map(|err| crate::prompts::LastTaskResult {
                files_modified: task.files_modified.clone(),
                error: Some(err.clone()),
            }),
            conversation_entries: Vec::new(),
        };
        let template = TemplateContext::default();

        let evidence = EvidenceRecorder::new(&self.evidence_dir);
        let mut completion = CompletionProtocol::new(evidence);

        let mut rejected_issues: Option<Vec<String>> = None;

        loop {
            task.attempt_count += 1;
            let run_id = new_run_id(&task.prompt);
            task.run_id = Some(run_id.clone());
            completion.bind_run(run_id.clone());

            // Step 3: assemble prompt.
            let prompt_result = match &rejected_issues {
                Some(issues) => completion_modification(&self.assembler, &task, &group_context, &template, issues),
                None => self.assembler.assemble(&task.prompt, &group_context, &template),
            };
            let sections = match prompt_result {
                Ok(sections) => sections,
                Err(err) => {
                    warn!(%task_id, %err, "TaskWorker::run_pipeline: prompt assembly failed");
                    self.finish(&task_id, TaskStatus::Error, Some(err.to_string()), Vec::new()).await;
                    return;
                }
            };

            // Step 4: Double Execution Gate, before invoking the executor.
            if let Err(gate_err) = completion.check_gates(self.api_key_present) {
                warn!(%task_id, %gate_err, "TaskWorker::run_pipeline: Double Execution Gate failed, task goes straight to ERROR");
                self.finish(&task_id, TaskStatus::Error, Some(gate_err.to_string()), Vec::new()).await;
                return;
            }

            // Step 5: RUNNING, invoke executor.
            if let Err(err) = self.queue.update_status(&task_id, TaskStatus::Running).await {
                warn!(%task_id, %err, "TaskWorker::run_pipeline: failed to mark RUNNING");
                return;
            }

            let request = ExecutorRequest {
                prompt: sections.joined(),
                task_id: task_id.clone(),
                session_id: task.session_id.clone(),
                run_id: run_id.as_str().to_string(),
                model: self.model.clone(),
                max_duration_ms: self.task_limits.seconds.saturating_mul(1000),
                cancel: cancel.clone(),
            };

            // §4.3/§7: cap concurrent executor invocations at
            // parallel_limits.executors, fail-closed if the permit can
            // never be granted (semaphore only closes if we close it,
            // which we never do, but the executor contract shouldn't
            // rely on that).
            let permit = match self.executor_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%task_id, "TaskWorker::run_pipeline: executor concurrency semaphore closed, failing closed");
                    self.finish(&task_id, TaskStatus::Incomplete, Some(ExecutorError::ResourceLimit("executors concurrency limit unavailable".to_string()).to_string()), Vec::new()).await;
                    return;
                }
            };

            let started = std::time::Instant::now();
            let outcome = self.executor.execute(request).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            drop(permit);

            match outcome {
                Ok(result) => {
                    let call_id = format!("{}:{}", run_id.as_str(), task.attempt_count);
                    let evidence_success = !matches!(result.status_hint, StatusHint::Error);
                    let _ = completion.evidence_recorder().record(LlmEvidence {
                        call_id,
                        provider: self.executor.name().to_string(),
                        model: self.model.clone(),
                        request_hash: domain::request_hash("user", &sections.joined()),
                        response_hash: evidence_success.then(|| domain::sha256_prefixed(&result.output)),
                        timestamp: chrono::Utc::now(),
                        duration_ms,
                        success: evidence_success,
                        error: result.structured_error.clone(),
                    });

                    if let Some(next) = self.handle_success(&task, task_type, &completion, result, duration_ms).await {
                        match next {
                            Outcome::Done { status, error, files_modified, output } => {
                                task.output = output;
                                self.finish_with_output(&task_id, status, error, files_modified, task.output.clone()).await;
                                return;
                            }
                            Outcome::RetryWithModification { issues } => {
                                if task.attempt_count >= self.retry.max_attempts {
                                    self.finish(&task_id, TaskStatus::Incomplete, Some("max retries exhausted after review rejection".to_string()), Vec::new()).await;
                                    return;
                                }
                                rejected_issues = Some(issues);
                                continue;
                            }
                        }
                    }
                    return;
                }
                Err(err) => {
                    let call_id = format!("{}:{}", run_id.as_str(), task.attempt_count);
                    let _ = completion.evidence_recorder().record(LlmEvidence {
                        call_id,
                        provider: self.executor.name().to_string(),
                        model: self.model.clone(),
                        request_hash: domain::request_hash("user", &sections.joined()),
                        response_hash: None,
                        timestamp: chrono::Utc::now(),
                        duration_ms,
                        success: false,
                        error: Some(err.to_string()),
                    });

                    if err.is_retryable() && task.attempt_count < self.retry.max_attempts {
                        let delay = backoff_delay(&self.retry, task.attempt_count);
                        info!(%task_id, attempt = task.attempt_count, delay_ms = delay.as_millis() as u64, "TaskWorker::run_pipeline: transient failure, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                self.finish(&task_id, TaskStatus::Cancelled, Some("cancelled during retry backoff".to_string()), Vec::new()).await;
                                return;
                            }
                        }
                        continue;
                    }

                    let final_status = if err.is_retryable() { TaskStatus::Incomplete } else { TaskStatus::Error };
                    warn!(%task_id, %err, ?final_status, "TaskWorker::run_pipeline: executor failure, not retrying further");
                    self.finish(&task_id, final_status, Some(err.to_string()), Vec::new()).await;
                    return;
                }
            }
        }
    }

    async fn handle_success(
        &self,
        task: &TaskRecord,
        task_type: TaskType,
        completion: &CompletionProtocol,
        result: crate::executor::ExecutorResult,
        _duration_ms: u64,
    ) -> Option<Outcome> {
        let task_id = &task.task_id;

        if let Some(violation) = self.check_resource_limits(&result) {
            warn!(%task_id, %violation, "TaskWorker::handle_success: resource limit exceeded, failing closed");
            let _ = self
                .queue
                .append_event(task_id, ProgressEvent::new(ProgressKind::LogChunk, serde_json::json!({"reason": violation.to_string()})))
                .await;
            return Some(Outcome::Done {
                status: TaskStatus::Incomplete,
                error: Some(violation.to_string()),
                files_modified: result.files_modified,
                output: Some(result.output),
            });
        }

        if result.status_hint == StatusHint::Blocked {
            let rewritten = guard::rewrite_blocked(task_id, task_type, TaskStatus::Blocked);
            return Some(Outcome::Done {
                status: rewritten,
                error: result.structured_error,
                files_modified: result.files_modified,
                output: Some(result.output),
            });
        }

        if result.status_hint == StatusHint::Error {
            return Some(Outcome::Done {
                status: TaskStatus::Error,
                error: result.structured_error.or_else(|| Some("executor reported ERROR".to_string())),
                files_modified: result.files_modified,
                output: Some(result.output),
            });
        }

        if matches!(task_type, TaskType::ReadInfo | TaskType::Report) {
            let answered = !result.output.trim().is_empty() && !has_outstanding_question(&result.output);
            if !answered {
                return Some(Outcome::Done {
                    status: TaskStatus::AwaitingResponse,
                    error: None,
                    files_modified: result.files_modified,
                    output: Some(result.output),
                });
            }
            // P5: COMPLETE only when verified evidence exists for the currently
            // bound run_id, same gate the QA-gate path below goes through.
            return Some(match completion.can_assert_complete() {
                Ok(()) => Outcome::Done {
                    status: TaskStatus::Complete,
                    error: None,
                    files_modified: result.files_modified,
                    output: Some(result.output),
                },
                Err(GateFailure::NoVerifiedEvidence) => Outcome::Done {
                    status: TaskStatus::Incomplete,
                    error: Some("no verified success evidence for this run".to_string()),
                    files_modified: result.files_modified,
                    output: Some(result.output),
                },
                Err(other) => Outcome::Done {
                    status: TaskStatus::Error,
                    error: Some(other.to_string()),
                    files_modified: result.files_modified,
                    output: Some(result.output),
                },
            });
        }

        let gates: Vec<QaGateResult> = result.gates;
        if gates.is_empty() {
            return Some(Outcome::Done {
                status: TaskStatus::AwaitingResponse,
                error: None,
                files_modified: result.files_modified,
                output: Some(result.output),
            });
        }

        match completion.judge(&gates) {
            Ok(verdict) if verdict.all_pass => match completion.can_assert_complete() {
                Ok(()) => Some(Outcome::Done {
                    status: TaskStatus::Complete,
                    error: None,
                    files_modified: result.files_modified,
                    output: Some(result.output),
                }),
                Err(GateFailure::NoVerifiedEvidence) => Some(Outcome::Done {
                    status: TaskStatus::Incomplete,
                    error: Some("no verified success evidence for this run".to_string()),
                    files_modified: result.files_modified,
                    output: Some(result.output),
                }),
                Err(other) => Some(Outcome::Done {
                    status: TaskStatus::Error,
                    error: Some(other.to_string()),
                    files_modified: result.files_modified,
                    output: Some(result.output),
                }),
            },
            Ok(verdict) => Some(Outcome::RetryWithModification {
                issues: if verdict.failing_gates.is_empty() {
                    vec!["no QA gates passed".to_string()]
                } else {
                    verdict.failing_gates
                },
            }),
            Err(err) => Some(Outcome::Done {
                status: TaskStatus::Incomplete,
                error: Some(err.to_string()),
                files_modified: result.files_modified,
                output: Some(result.output),
            }),
        }
    }

    /// §4.3/§7 resource caps: `files_touched` ≤20 and `tests_run` ≤50
    /// (`task_limits` is already `.clamped()` at construction). Tests
    /// run is the sum of passing/failing/skipped across every reported
    /// gate, since the executor contract has no separate counter.
    fn check_resource_limits(&self, result: &crate::executor::ExecutorResult) -> Option<ExecutorError> {
        let files_touched = result.files_modified.len() as u32;
        if files_touched > self.task_limits.files_touched {
            return Some(ExecutorError::ResourceLimit(format!(
                "files_touched {files_touched} exceeds task_limits.files_touched {}",
                self.task_limits.files_touched
            )));
        }

        let tests_run: i64 = result.gates.iter().map(|g| g.passing + g.failing + g.skipped).sum();
        let tests_run = tests_run.max(0) as u64;
        if tests_run > self.task_limits.tests_run as u64 {
            return Some(ExecutorError::ResourceLimit(format!(
                "tests_run {tests_run} exceeds task_limits.tests_run {}",
                self.task_limits.tests_run
            )));
        }

        None
    }

    async fn finish(&self, task_id: &str, status: TaskStatus, error: Option<String>, files_modified: Vec<String>) {
        self.finish_with_output(task_id, status, error, files_modified, None).await;
    }

    async fn finish_with_output(&self, task_id: &str, status: TaskStatus, error: Option<String>, files_modified: Vec<String>, output: Option<String>) {
        let record = match self.queue.get(task_id).await {
            Ok(Some(record)) => record,
            _ => {
                warn!(%task_id, "TaskWorker::finish: task vanished before final write");
                return;
            }
        };
        if record.status.is_terminal() {
            return;
        }
        let mut record = record;
        record.error = error;
        record.files_modified = files_modified;
        if output.is_some() {
            record.output = output;
        }
        record.status = status;
        if let Err(err) = self.queue.put(record).await {
            warn!(%task_id, %err, "TaskWorker::finish: failed to persist final status");
        }
    }
}

enum Outcome {
    Done { status: TaskStatus, error: Option<String>, files_modified: Vec<String>, output: Option<String> },
    RetryWithModification { issues: Vec<String> },
}

fn completion_modification(
    assembler: &PromptAssembler,
    task: &TaskRecord,
    group_context: &TaskGroupContext,
    template: &TemplateContext,
    issues: &[String],
) -> Result<domain::PromptSections, crate::error::PromptError> {
    let modification = domain::ModificationPrompt { detected_issues: issues.to_vec(), original_task: task.prompt.clone() };
    assembler.assemble_with_modification(&task.prompt, group_context, template, &modification)
}

/// Exponential backoff starting at `initial_backoff_ms`, doubling per
/// attempt, capped at `backoff_cap_ms`, with up to 20% jitter so
/// concurrent retries on the same namespace don't thunder in lockstep.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = retry.initial_backoff_ms.saturating_mul(1u64 << exp).min(retry.backoff_cap_ms);
    let jitter_max = (base / 5).max(1);
    let jitter = rand::rng().random_range(0..=jitter_max);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_outstanding_question_detects_clarification_request() {
        assert!(has_outstanding_question("Could you clarify which file you mean?"));
        assert!(!has_outstanding_question("Done. Changed src/lib.rs."));
    }

    #[test]
    fn backoff_delay_respects_cap() {
        let retry = RetryConfig { max_attempts: 10, initial_backoff_ms: 1000, backoff_cap_ms: 5000, retry_threshold: 2 };
        let d = backoff_delay(&retry, 10);
        assert!(d.as_millis() as u64 <= 5000 + 1000);
    }

    #[test]
    fn backoff_delay_doubles_each_attempt() {
        let retry = RetryConfig { max_attempts: 10, initial_backoff_ms: 1000, backoff_cap_ms: 60_000, retry_threshold: 2 };
        let first = backoff_delay(&retry, 1).as_millis();
        let second = backoff_delay(&retry, 2).as_millis();
        assert!(second as i128 >= first as i128);
    }
}
