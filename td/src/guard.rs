//! The Guard: enforces that `BLOCKED` only ever reaches a DANGEROUS_OP
//! task, rewriting it to `INCOMPLETE` for every other task type.

use tracing::warn;

use crate::domain::{TaskStatus, TaskType};

/// Rewrite `status` if it is `BLOCKED` on a task type other than
/// `DANGEROUS_OP`. The conversion is always logged, since a BLOCKED
/// verdict arriving for the wrong task type means the executor (or a
/// caller constructing a status update by hand) got something wrong.
pub fn rewrite_blocked(task_id: &str, task_type: TaskType, status: TaskStatus) -> TaskStatus {
    if status == TaskStatus::Blocked && task_type != TaskType::DangerousOp {
        warn!(
            %task_id,
            ?task_type,
            "guard::rewrite_blocked: BLOCKED is only valid for DANGEROUS_OP, rewriting to INCOMPLETE"
        );
        return TaskStatus::Incomplete;
    }
    status
}
