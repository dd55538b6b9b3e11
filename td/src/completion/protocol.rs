//! `CompletionProtocol`: wraps `domain::gate::judge` with the
//! Double Execution Gate that guards task-level COMPLETE assertions.

use tracing::{debug, warn};

use crate::domain::{self, CompletionVerdict, QaGateResult, RunId};
use crate::error::CompletionError;

use super::evidence::EvidenceRecorder;

/// Why the Double Execution Gate refused to assert COMPLETE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFailure {
    /// Gate 1: no credential is configured for the requested provider.
    MissingApiKey,
    /// Gate 2: the evidence directory could not be written to.
    EvidenceDirNotWritable,
    /// Both gates passed but no verified success evidence exists yet
    /// for the current run id.
    NoVerifiedEvidence,
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateFailure::MissingApiKey => write!(f, "API key gate failed: no credential configured"),
            GateFailure::EvidenceDirNotWritable => write!(f, "evidence directory gate failed: not writable"),
            GateFailure::NoVerifiedEvidence => write!(f, "no verified success evidence for current run"),
        }
    }
}

/// Holds the evidence recorder a task's namespace writes to and the
/// run id currently bound to it, if any.
pub struct CompletionProtocol {
    evidence: EvidenceRecorder,
    bound_run_id: Option<RunId>,
}

impl CompletionProtocol {
    pub fn new(evidence: EvidenceRecorder) -> Self {
        Self { evidence, bound_run_id: None }
    }

    pub fn bind_run(&mut self, run_id: RunId) {
        self.bound_run_id = Some(run_id);
    }

    /// Gate 1 — API key gate. The worker calls this with whatever the
    /// executor's own construction already proved: the gate is
    /// non-skippable because executor construction itself fails when
    /// a credential is missing, so by the time a request reaches here
    /// `api_key_present` is already known.
    fn gate1_api_key(api_key_present: bool) -> Result<(), GateFailure> {
        if api_key_present { Ok(()) } else { Err(GateFailure::MissingApiKey) }
    }

    /// Gate 2 — evidence directory gate.
    fn gate2_evidence_dir(&self) -> Result<(), GateFailure> {
        if self.evidence.is_writable() { Ok(()) } else { Err(GateFailure::EvidenceDirNotWritable) }
    }

    /// Run both gates up front, before the executor is ever invoked:
    /// either failure sends the task straight to ERROR without an
    /// executor call.
    pub fn check_gates(&self, api_key_present: bool) -> Result<(), GateFailure> {
        debug!(api_key_present, "CompletionProtocol::check_gates: called");
        Self::gate1_api_key(api_key_present)?;
        self.gate2_evidence_dir()?;
        Ok(())
    }

    /// Task-level COMPLETE may be asserted iff both gates passed
    /// (checked by the caller before invoking the executor) and at
    /// least one verified success evidence exists for the bound run.
    pub fn can_assert_complete(&self) -> Result<(), GateFailure> {
        let verified = match &self.bound_run_id {
            Some(run_id) => !self.evidence.verified_for_run(run_id.as_str()).is_empty(),
            None => self.evidence.can_assert_complete(),
        };
        if verified {
            Ok(())
        } else {
            warn!("CompletionProtocol::can_assert_complete: no verified success evidence for bound run");
            Err(GateFailure::NoVerifiedEvidence)
        }
    }

    pub fn evidence_recorder(&self) -> &EvidenceRecorder {
        &self.evidence
    }

    /// Aggregate `gates` into a verdict, validated against whichever
    /// run id is currently bound.
    pub fn judge(&self, gates: &[QaGateResult]) -> Result<CompletionVerdict, CompletionError> {
        domain::judge(gates, self.bound_run_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::new_run_id;

    #[test]
    fn missing_api_key_fails_gate_one_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = CompletionProtocol::new(EvidenceRecorder::new(dir.path()));
        let err = protocol.check_gates(false).unwrap_err();
        assert_eq!(err, GateFailure::MissingApiKey);
    }

    #[test]
    fn both_gates_pass_when_key_present_and_dir_writable() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = CompletionProtocol::new(EvidenceRecorder::new(dir.path()));
        assert!(protocol.check_gates(true).is_ok());
    }

    #[test]
    fn cannot_assert_complete_with_no_evidence_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let protocol = CompletionProtocol::new(EvidenceRecorder::new(dir.path()));
        assert_eq!(protocol.can_assert_complete().unwrap_err(), GateFailure::NoVerifiedEvidence);
    }

    #[test]
    fn can_assert_complete_once_a_verified_success_exists_for_bound_run() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = EvidenceRecorder::new(dir.path());
        let run_id = new_run_id("seed");

        let mut protocol = CompletionProtocol::new(recorder);
        protocol.bind_run(run_id.clone());
        assert_eq!(protocol.can_assert_complete().unwrap_err(), GateFailure::NoVerifiedEvidence);

        let evidence = crate::domain::LlmEvidence {
            call_id: format!("{}:1", run_id.as_str()),
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4".to_string(),
            request_hash: "sha256:abc".to_string(),
            response_hash: Some("sha256:def".to_string()),
            timestamp: chrono::Utc::now(),
            duration_ms: 5,
            success: true,
            error: None,
        };
        protocol.evidence_recorder().record(evidence).unwrap();
        assert!(protocol.can_assert_complete().is_ok());
    }
}
