//! Commands and replies exchanged with the `QueueStore` actor.

use tokio::sync::oneshot;

use crate::domain::{ProgressEvent, TaskRecord, TaskStatus};
use crate::error::QueueError;

pub type QueueResponse<T> = Result<T, QueueError>;

#[derive(Debug)]
pub enum QueueCommand {
    Enqueue {
        record: TaskRecord,
        reply: oneshot::Sender<QueueResponse<TaskRecord>>,
    },
    Get {
        task_id: String,
        reply: oneshot::Sender<QueueResponse<Option<TaskRecord>>>,
    },
    UpdateStatus {
        task_id: String,
        status: TaskStatus,
        reply: oneshot::Sender<QueueResponse<TaskRecord>>,
    },
    AppendEvent {
        task_id: String,
        event: ProgressEvent,
        reply: oneshot::Sender<QueueResponse<TaskRecord>>,
    },
    ListByNamespace {
        namespace: String,
        status: Option<TaskStatus>,
        reply: oneshot::Sender<QueueResponse<Vec<TaskRecord>>>,
    },
    ListByStatus {
        status: TaskStatus,
        reply: oneshot::Sender<QueueResponse<Vec<TaskRecord>>>,
    },
    Put {
        record: TaskRecord,
        reply: oneshot::Sender<QueueResponse<TaskRecord>>,
    },
}
