mod evidence;
mod protocol;

pub use evidence::EvidenceRecorder;
pub use protocol::{CompletionProtocol, GateFailure};
