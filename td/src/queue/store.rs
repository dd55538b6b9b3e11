//! `QueueStore`: the actor that owns the namespace's `TaskRecord` store.
//!
//! One `QueueStore` is spawned per namespace (each with its own
//! `taskstore::Store` rooted at that namespace's state directory), so
//! namespaces never contend on the same SQLite index or file lock.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use taskstore::{Filter, Store};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{ProgressEvent, TaskRecord, TaskStatus, now_ms};
use crate::error::QueueError;

use super::messages::{QueueCommand, QueueResponse};

/// Broadcast so the supervisor and any CLI watchers can react to queue
/// activity without the queue actor knowing who is listening.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { task_id: String },
    StatusChanged { task_id: String, from: TaskStatus, to: TaskStatus },
}

/// Handle to a namespace's queue actor. Cheap to clone; every clone
/// shares the same channel and sequence counter.
#[derive(Clone)]
pub struct QueueStore {
    tx: mpsc::Sender<QueueCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
    seq: Arc<AtomicI64>,
}

impl QueueStore {
    /// Open the on-disk store at `base_path`, rebuild its index, and
    /// spawn the owning actor task.
    pub fn spawn(base_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let base_path = base_path.as_ref();
        debug!(?base_path, "QueueStore::spawn: called");
        let store = Store::open(base_path)?;
        let count = store.rebuild_indexes::<TaskRecord>()?;
        info!(count, ?base_path, "QueueStore::spawn: rebuilt task index");

        let max_seq = store.list::<TaskRecord>(&[])?.iter().map(|t| t.seq).max().unwrap_or(0);

        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(256);
        let seq = Arc::new(AtomicI64::new(max_seq));

        tokio::spawn(actor_loop(store, rx, event_tx.clone()));

        Ok(Self { tx, event_tx, seq })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Allocate the next enqueue-order sequence number. Called once per
    /// task, before the record is built, so seq assignment never blocks
    /// on the actor loop.
    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn enqueue(&self, record: TaskRecord) -> QueueResponse<TaskRecord> {
        debug!(task_id = %record.task_id, "QueueStore::enqueue: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Enqueue { record, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub async fn get(&self, task_id: &str) -> QueueResponse<Option<TaskRecord>> {
        debug!(%task_id, "QueueStore::get: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Get { task_id: task_id.to_string(), reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> QueueResponse<TaskRecord> {
        debug!(%task_id, ?status, "QueueStore::update_status: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::UpdateStatus { task_id: task_id.to_string(), status, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub async fn append_event(&self, task_id: &str, event: ProgressEvent) -> QueueResponse<TaskRecord> {
        debug!(%task_id, "QueueStore::append_event: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::AppendEvent { task_id: task_id.to_string(), event, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub async fn list_by_namespace(&self, namespace: &str, status: Option<TaskStatus>) -> QueueResponse<Vec<TaskRecord>> {
        debug!(%namespace, ?status, "QueueStore::list_by_namespace: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::ListByNamespace { namespace: namespace.to_string(), status, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> QueueResponse<Vec<TaskRecord>> {
        debug!(?status, "QueueStore::list_by_status: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::ListByStatus { status, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    /// Replace a record wholesale. Used by the worker to persist output,
    /// files_modified, and attempt_count alongside a status transition
    /// in one write.
    pub async fn put(&self, record: TaskRecord) -> QueueResponse<TaskRecord> {
        debug!(task_id = %record.task_id, "QueueStore::put: called");
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Put { record, reply })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        reply_rx.await.map_err(|_| QueueError::ChannelClosed)?
    }
}

/// Bump `updated_at` to a value strictly greater than the record's
/// current one, even if called twice within the same millisecond.
fn bump_updated_at(record: &mut TaskRecord) {
    let now = now_ms();
    record.updated_at = if now > record.updated_at { now } else { record.updated_at + 1 };
}

async fn actor_loop(store: Store, mut rx: mpsc::Receiver<QueueCommand>, event_tx: broadcast::Sender<QueueEvent>) {
    debug!("queue actor_loop: started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            QueueCommand::Enqueue { record, reply } => {
                let task_id = record.task_id.clone();
                let result = store.create(record).map_err(QueueError::from);
                if result.is_ok() {
                    let _ = event_tx.send(QueueEvent::Enqueued { task_id });
                }
                let _ = reply.send(result);
            }
            QueueCommand::Get { task_id, reply } => {
                let result = store.get::<TaskRecord>(&task_id).map_err(QueueError::from);
                let _ = reply.send(result);
            }
            QueueCommand::UpdateStatus { task_id, status, reply } => {
                let result = (|| -> QueueResponse<TaskRecord> {
                    let mut record = store
                        .get::<TaskRecord>(&task_id)?
                        .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;
                    if record.status.is_terminal() && record.status != status {
                        return Err(QueueError::TerminalRegression {
                            task_id: task_id.clone(),
                            from: record.status.to_string(),
                            to: status.to_string(),
                        });
                    }
                    let from = record.status;
                    record.status = status;
                    if status.is_terminal() {
                        record.completed_at = Some(now_ms());
                    }
                    record.append_event(ProgressEvent::status_changed(from, status));
                    bump_updated_at(&mut record);
                    let saved = store.update(record)?;
                    let _ = event_tx.send(QueueEvent::StatusChanged { task_id: task_id.clone(), from, to: status });
                    Ok(saved)
                })();
                let _ = reply.send(result);
            }
            QueueCommand::AppendEvent { task_id, event, reply } => {
                let result = (|| -> QueueResponse<TaskRecord> {
                    let mut record = store
                        .get::<TaskRecord>(&task_id)?
                        .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;
                    record.append_event(event);
                    bump_updated_at(&mut record);
                    Ok(store.update(record)?)
                })();
                let _ = reply.send(result);
            }
            QueueCommand::ListByNamespace { namespace, status, reply } => {
                let mut filters = vec![Filter::eq("namespace", namespace)];
                if let Some(status) = status {
                    filters.push(Filter::eq("status", status.to_string()));
                }
                let result = store.list::<TaskRecord>(&filters).map_err(QueueError::from);
                let _ = reply.send(result);
            }
            QueueCommand::ListByStatus { status, reply } => {
                let result = store.list::<TaskRecord>(&[Filter::eq("status", status.to_string())]).map_err(QueueError::from);
                let _ = reply.send(result);
            }
            QueueCommand::Put { mut record, reply } => {
                let result = (|| -> QueueResponse<(TaskRecord, Option<(TaskStatus, TaskStatus)>)> {
                    let existing = store.get::<TaskRecord>(&record.task_id)?;
                    if let Some(existing) = &existing {
                        if existing.status.is_terminal() && existing.status != record.status {
                            return Err(QueueError::TerminalRegression {
                                task_id: record.task_id.clone(),
                                from: existing.status.to_string(),
                                to: record.status.to_string(),
                            });
                        }
                    } else {
                        warn!(task_id = %record.task_id, "queue actor_loop: Put on unknown task id, inserting");
                    }

                    // §4.3 step 7 / §7: a terminal-state transition always appends
                    // its own completion event and fans out a StatusChanged
                    // notification, even when persisted through `put` rather than
                    // `update_status`.
                    let transition = existing.as_ref().map(|e| e.status).filter(|from| *from != record.status).map(|from| (from, record.status));
                    if let Some((from, to)) = transition {
                        record.append_event(ProgressEvent::status_changed(from, to));
                        if to.is_terminal() {
                            record.completed_at = Some(now_ms());
                        }
                    }
                    bump_updated_at(&mut record);
                    let saved = store.update(record)?;
                    Ok((saved, transition))
                })();

                match result {
                    Ok((saved, Some((from, to)))) => {
                        let _ = event_tx.send(QueueEvent::StatusChanged { task_id: saved.task_id.clone(), from, to });
                        let _ = reply.send(Ok(saved));
                    }
                    Ok((saved, None)) => {
                        let _ = reply.send(Ok(saved));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }
    debug!("queue actor_loop: channel closed, exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProgressKind, TaskRecord, TaskType};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, QueueStore) {
        let dir = TempDir::new().unwrap();
        let queue = QueueStore::spawn(dir.path()).unwrap();
        (dir, queue)
    }

    #[tokio::test]
    async fn enqueue_then_get_round_trips() {
        let (_dir, queue) = test_store().await;
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record.clone()).await.unwrap();

        let fetched = queue.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched.task_id, "t1");
        assert_eq!(fetched.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn update_status_appends_status_changed_event() {
        let (_dir, queue) = test_store().await;
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record).await.unwrap();

        let updated = queue.update_status("t1", TaskStatus::Running).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Running);
        assert_eq!(updated.progress_events.len(), 1);
    }

    #[tokio::test]
    async fn terminal_status_cannot_regress() {
        let (_dir, queue) = test_store().await;
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record).await.unwrap();
        queue.update_status("t1", TaskStatus::Complete).await.unwrap();

        let err = queue.update_status("t1", TaskStatus::Running).await.unwrap_err();
        assert!(matches!(err, QueueError::TerminalRegression { .. }));
    }

    #[tokio::test]
    async fn completed_at_set_on_terminal_transition() {
        let (_dir, queue) = test_store().await;
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record).await.unwrap();
        let done = queue.update_status("t1", TaskStatus::Complete).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_by_namespace_preserves_enqueue_order() {
        let (_dir, queue) = test_store().await;
        for i in 0..3 {
            let seq = queue.next_seq();
            let record = TaskRecord::new(format!("t{i}"), "ns-a", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
            queue.enqueue(record).await.unwrap();
        }
        let listed = queue.list_by_namespace("ns-a", None).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.task_id.as_str()).collect::<Vec<_>>(), vec!["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn put_on_terminal_transition_appends_event_and_broadcasts() {
        let (_dir, queue) = test_store().await;
        let mut rx = queue.subscribe_events();
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record.clone()).await.unwrap();
        let _ = rx.recv().await.unwrap(); // Enqueued

        let mut done = record;
        done.status = TaskStatus::Complete;
        done.output = Some("finished".to_string());
        let saved = queue.put(done).await.unwrap();

        assert!(saved.completed_at.is_some());
        assert!(matches!(saved.progress_events.last().unwrap().kind, ProgressKind::StatusChanged { to: TaskStatus::Complete, .. }));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, QueueEvent::StatusChanged { to: TaskStatus::Complete, .. }));
    }

    #[tokio::test]
    async fn put_without_status_change_appends_no_event() {
        let (_dir, queue) = test_store().await;
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record.clone()).await.unwrap();

        let mut same_status = record;
        same_status.output = Some("progress note".to_string());
        let saved = queue.put(same_status).await.unwrap();
        assert!(saved.progress_events.is_empty());
    }

    #[tokio::test]
    async fn events_broadcast_on_enqueue_and_status_change() {
        let (_dir, queue) = test_store().await;
        let mut rx = queue.subscribe_events();
        let seq = queue.next_seq();
        let record = TaskRecord::new("t1", "default", "s1", "th1", None, TaskType::ReadInfo, "hello", seq);
        queue.enqueue(record).await.unwrap();
        queue.update_status("t1", TaskStatus::Running).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, QueueEvent::Enqueued { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, QueueEvent::StatusChanged { .. }));
    }
}
