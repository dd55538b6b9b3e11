//! `Supervisor`: periodic staleness scan, timeout enforcement, restart
//! recovery decisions, retry escalation reporting, and the idle-exit
//! watchdog. Runs on its own loop alongside every namespace's
//! `TaskWorker`, modelled on the same "testable `check_once` plus a
//! `run()` sleep wrapper" shape used for polling watchers elsewhere in
//! this codebase.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, SupervisorConfig, Timeouts};
use crate::domain::{TaskRecord, TaskStatus, now_ms};
use crate::queue::QueueStore;

/// A stale or timed-out task entry written to `.stale-runs.json`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StaleRunEntry {
    pub task_id: String,
    pub title: String,
    pub status: String,
    pub age_minutes: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorEventRecord {
    pub task_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub cause: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started(SupervisorEventRecord),
    Stopped(SupervisorEventRecord),
    Check(SupervisorEventRecord),
    Complete(SupervisorEventRecord),
    Retry(SupervisorEventRecord),
    MaxRetries(SupervisorEventRecord),
    NoEvidence(SupervisorEventRecord),
    Invalid(SupervisorEventRecord),
    Error(SupervisorEventRecord),
    Timeout(SupervisorEventRecord),
}

/// The post-restart recovery choice for an orphaned RUNNING task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Partial artifacts exist: step-log events and non-empty output.
    SoftResume,
    /// Default otherwise: revert in-place changes, mint a new run_id,
    /// re-enqueue.
    RollbackReplay,
}

/// Decide how to recover an orphaned RUNNING task found at startup.
pub fn decide_restart(has_step_log_events: bool, has_non_empty_output: bool) -> RestartDecision {
    if has_step_log_events && has_non_empty_output { RestartDecision::SoftResume } else { RestartDecision::RollbackReplay }
}

/// The fixed model-profile escalation path the supervisor reports
/// after `retry_threshold` consecutive failures. The supervisor only
/// reports the recommendation; it never mutates the profile itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProfile {
    Planning,
    Standard,
    Advanced,
}

impl ModelProfile {
    pub fn escalate(self) -> Self {
        match self {
            ModelProfile::Planning => ModelProfile::Standard,
            ModelProfile::Standard => ModelProfile::Advanced,
            ModelProfile::Advanced => ModelProfile::Advanced,
        }
    }
}

/// `now - last_progress` in milliseconds, using the latest
/// `progress_events` timestamp when present, else `updated_at`.
fn idle_age_ms(task: &TaskRecord) -> i64 {
    let last_progress_ms = task
        .progress_events
        .last()
        .map(|e| e.timestamp.timestamp_millis())
        .unwrap_or(task.updated_at);
    (now_ms() - last_progress_ms).max(0)
}

fn wall_age_ms(task: &TaskRecord) -> i64 {
    (now_ms() - task.created_at).max(0)
}

pub struct Supervisor {
    queue: QueueStore,
    state_dir: PathBuf,
    config: SupervisorConfig,
    timeouts: Timeouts,
    retry: RetryConfig,
    event_tx: broadcast::Sender<SupervisorEvent>,
    consecutive_failures: HashMap<String, u32>,
    /// Terminal task ids already folded into `consecutive_failures` /
    /// emitted as `Complete`, so a never-deleted terminal record isn't
    /// re-counted on every subsequent scan.
    seen_terminal: std::collections::HashSet<String>,
    last_activity: Instant,
}

impl Supervisor {
    pub fn new(queue: QueueStore, state_dir: PathBuf, config: SupervisorConfig, timeouts: Timeouts, retry: RetryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            queue,
            state_dir,
            config,
            timeouts,
            retry,
            event_tx,
            consecutive_failures: HashMap::new(),
            seen_terminal: std::collections::HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// One scan pass: timeout enforcement, staleness sidecar, retry
    /// escalation reporting. Returns the number of RUNNING tasks
    /// inspected, for tests and logging.
    pub async fn check_once(&mut self) -> eyre::Result<usize> {
        debug!("Supervisor::check_once: called");
        self.emit(SupervisorEvent::Check(SupervisorEventRecord::default()));

        let running = self.queue.list_by_status(TaskStatus::Running).await?;
        let idle_timeout_ms = (self.config.profile.idle_timeout_secs() * 1000) as i64;
        let hard_timeout_ms = (self.config.profile.hard_timeout_secs() * 1000) as i64;
        let stale_idle_ms = self.timeouts.idle_minutes as i64 * 60_000;

        let mut stale_entries = Vec::new();

        for task in &running {
            let idle_ms = idle_age_ms(task);
            let wall_ms = wall_age_ms(task);

            if idle_ms >= stale_idle_ms {
                stale_entries.push(StaleRunEntry {
                    task_id: task.task_id.clone(),
                    title: task.prompt.chars().take(80).collect(),
                    status: task.status.to_string(),
                    age_minutes: idle_ms as f64 / 60_000.0,
                });
            }

            if idle_ms >= idle_timeout_ms || wall_ms >= hard_timeout_ms {
                let cause = if wall_ms >= hard_timeout_ms { "hard_timeout" } else { "idle_timeout" };
                warn!(task_id = %task.task_id, cause, "Supervisor::check_once: timeout, transitioning to AWAITING_RESPONSE");
                if let Err(err) = self.queue.update_status(&task.task_id, TaskStatus::AwaitingResponse).await {
                    warn!(task_id = %task.task_id, %err, "Supervisor::check_once: failed to write timeout transition");
                } else {
                    self.emit(SupervisorEvent::Timeout(SupervisorEventRecord {
                        task_id: Some(task.task_id.clone()),
                        duration_ms: Some(idle_ms as u64),
                        cause: Some(cause.to_string()),
                    }));
                }
            }
        }

        self.write_stale_sidecar(&stale_entries)?;

        for terminal_status in [TaskStatus::Error, TaskStatus::Incomplete] {
            for task in self.queue.list_by_status(terminal_status).await? {
                self.note_outcome(&task);
            }
        }

        if !running.is_empty() || !stale_entries.is_empty() {
            self.last_activity = Instant::now();
        }

        Ok(running.len())
    }

    /// Track consecutive failures per task-group and report (never
    /// apply) the escalation recommendation once `retry_threshold` is
    /// crossed.
    fn note_outcome(&mut self, task: &TaskRecord) {
        if !self.seen_terminal.insert(task.task_id.clone()) {
            return;
        }
        let key = task.thread_id.clone();
        match task.status {
            TaskStatus::Complete => {
                self.consecutive_failures.remove(&key);
                self.emit(SupervisorEvent::Complete(SupervisorEventRecord {
                    task_id: Some(task.task_id.clone()),
                    duration_ms: task.completed_at.map(|c| (c - task.created_at).max(0) as u64),
                    cause: None,
                }));
            }
            TaskStatus::Error | TaskStatus::Incomplete => {
                let count = self.consecutive_failures.entry(key).or_insert(0);
                *count += 1;
                if *count >= self.retry.retry_threshold {
                    info!(task_id = %task.task_id, failures = *count, "Supervisor::note_outcome: retry_threshold reached, recommending escalation");
                    self.emit(SupervisorEvent::MaxRetries(SupervisorEventRecord {
                        task_id: Some(task.task_id.clone()),
                        duration_ms: None,
                        cause: Some(format!("{} consecutive failures", *count)),
                    }));
                } else {
                    self.emit(SupervisorEvent::Retry(SupervisorEventRecord {
                        task_id: Some(task.task_id.clone()),
                        duration_ms: None,
                        cause: task.error.clone(),
                    }));
                }
            }
            _ => {}
        }
    }

    fn write_stale_sidecar(&self, entries: &[StaleRunEntry]) -> eyre::Result<()> {
        let path = self.state_dir.join(".stale-runs.json");
        let body = serde_json::to_vec_pretty(entries)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// `true` once no RUNNING task and no stale entry has been
    /// observed for `idle_exit_minutes`; the caller's `run()` loop
    /// exits cleanly when this flips.
    fn should_idle_exit(&self) -> bool {
        self.last_activity.elapsed() >= Duration::from_secs(self.config.idle_exit_minutes as u64 * 60)
    }

    /// Run the scan loop until the idle-exit watchdog trips.
    pub async fn run(mut self) {
        info!(scan_interval_seconds = self.config.scan_interval_seconds, "Supervisor::run: started");
        self.emit(SupervisorEvent::Started(SupervisorEventRecord::default()));
        loop {
            if let Err(err) = self.check_once().await {
                warn!(%err, "Supervisor::run: scan failed");
                self.emit(SupervisorEvent::Error(SupervisorEventRecord { task_id: None, duration_ms: None, cause: Some(err.to_string()) }));
            }
            if self.should_idle_exit() {
                info!("Supervisor::run: idle-exit watchdog tripped, stopping");
                self.emit(SupervisorEvent::Stopped(SupervisorEventRecord::default()));
                break;
            }
            tokio::time::sleep(Duration::from_secs(self.config.scan_interval_seconds)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, QueueStore, Supervisor) {
        let dir = TempDir::new().unwrap();
        let queue = QueueStore::spawn(dir.path()).unwrap();
        let supervisor = Supervisor::new(
            queue.clone(),
            dir.path().to_path_buf(),
            SupervisorConfig::default(),
            Timeouts::default(),
            RetryConfig::default(),
        );
        (dir, queue, supervisor)
    }

    #[test]
    fn decide_restart_soft_resumes_only_with_partial_artifacts() {
        assert_eq!(decide_restart(true, true), RestartDecision::SoftResume);
        assert_eq!(decide_restart(true, false), RestartDecision::RollbackReplay);
        assert_eq!(decide_restart(false, true), RestartDecision::RollbackReplay);
        assert_eq!(decide_restart(false, false), RestartDecision::RollbackReplay);
    }

    #[test]
    fn model_profile_escalates_along_fixed_path_and_caps_at_advanced() {
        assert_eq!(ModelProfile::Planning.escalate(), ModelProfile::Standard);
        assert_eq!(ModelProfile::Standard.escalate(), ModelProfile::Advanced);
        assert_eq!(ModelProfile::Advanced.escalate(), ModelProfile::Advanced);
    }

    #[tokio::test]
    async fn check_once_with_no_running_tasks_writes_empty_sidecar() {
        let (dir, _queue, mut supervisor) = fixture().await;
        let inspected = supervisor.check_once().await.unwrap();
        assert_eq!(inspected, 0);
        let sidecar = dir.path().join(".stale-runs.json");
        let entries: Vec<StaleRunEntry> = serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn check_once_reports_max_retries_after_threshold() {
        let (_dir, queue, mut supervisor) = fixture().await;
        let mut rx = supervisor.subscribe();

        for i in 0..2 {
            let seq = queue.next_seq();
            let record = TaskRecord::new(format!("t{i}"), "default", "s1", "thread-a", None, TaskType::ReadInfo, "hello", seq);
            queue.enqueue(record).await.unwrap();
            queue.update_status(&format!("t{i}"), TaskStatus::Running).await.unwrap();
            queue.update_status(&format!("t{i}"), TaskStatus::Error).await.unwrap();
        }

        supervisor.check_once().await.unwrap();

        let mut saw_max_retries = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SupervisorEvent::MaxRetries(_)) {
                saw_max_retries = true;
            }
        }
        assert!(saw_max_retries);
    }

    #[tokio::test]
    async fn stale_task_is_written_to_sidecar() {
        let (dir, queue, mut supervisor) = fixture().await;
        let seq = queue.next_seq();
        let mut record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::Implementation, "do work", seq);
        record.created_at = now_ms() - 60 * 60_000;
        record.updated_at = record.created_at;
        record.status = TaskStatus::Running;
        queue.enqueue(record).await.unwrap();

        supervisor.check_once().await.unwrap();
        let sidecar = dir.path().join(".stale-runs.json");
        let entries: Vec<StaleRunEntry> = serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "t1");
    }
}
