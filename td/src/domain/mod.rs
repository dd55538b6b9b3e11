//! Core domain types.
//!
//! Every entity named in the data model derives `Serialize`,
//! `Deserialize`, `Debug`, `Clone`, and (where equality is meaningful
//! for tests) `PartialEq`. Timestamps are milliseconds since the Unix
//! epoch internally, for monotonic comparison, and render as RFC3339
//! through `chrono` at any JSON boundary that wants it.

mod evidence;
mod gate;
mod prompt;
mod run;
mod task;

pub use evidence::{EvidenceEnvelope, LlmEvidence, request_hash, sha256_prefixed};
pub use gate::{CompletionVerdict, FinalStatus, QaGateResult, judge};
pub use prompt::{ModificationPrompt, PromptSections};
pub use run::{RunId, new_run_id};
pub use task::{ProgressEvent, ProgressKind, TaskRecord, TaskStatus, TaskType, detect_task_type};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
