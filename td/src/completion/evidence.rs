//! `EvidenceRecorder`: the durable, tamper-evident ledger of LLM call
//! attempts that the Double Execution Gate reads from.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::{EvidenceEnvelope, LlmEvidence};
use crate::error::EvidenceError;

/// One `<evidenceDir>/llm/<call_id>.json` file per call, atomically
/// written. Append-only: call ids are globally unique, so no
/// intra-file locking is needed across concurrent recorders.
pub struct EvidenceRecorder {
    llm_dir: PathBuf,
}

impl EvidenceRecorder {
    /// `evidence_dir` is the state directory's evidence root; evidence
    /// files live under its `llm/` subdirectory.
    pub fn new(evidence_dir: impl AsRef<Path>) -> Self {
        Self { llm_dir: evidence_dir.as_ref().join("llm") }
    }

    /// Gate 2: the on-disk evidence directory is writable. Creates it
    /// if missing and probes with a throwaway file.
    pub fn is_writable(&self) -> bool {
        if std::fs::create_dir_all(&self.llm_dir).is_err() {
            return false;
        }
        let probe = self.llm_dir.join(".write-probe");
        let ok = std::fs::write(&probe, b"").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    }

    fn path_for(&self, call_id: &str) -> PathBuf {
        self.llm_dir.join(format!("{call_id}.json"))
    }

    /// Serialise `evidence` into a sealed envelope and write it
    /// atomically (write-temp-then-rename), matching the QueueStore's
    /// persistence idiom.
    pub fn record(&self, evidence: LlmEvidence) -> Result<(), EvidenceError> {
        debug!(call_id = %evidence.call_id, success = evidence.success, "EvidenceRecorder::record: called");
        std::fs::create_dir_all(&self.llm_dir)?;
        let envelope = EvidenceEnvelope::seal(evidence)?;
        let path = self.path_for(&envelope.evidence.call_id);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&envelope)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Recompute and compare the integrity hash; read or parse errors
    /// also count as verification failure.
    pub fn verify(&self, call_id: &str) -> Result<bool, EvidenceError> {
        let envelope = self.read(call_id)?;
        Ok(envelope.verify().map_err(EvidenceError::Serde)?)
    }

    fn read(&self, call_id: &str) -> Result<EvidenceEnvelope, EvidenceError> {
        let path = self.path_for(call_id);
        let body = std::fs::read_to_string(&path).map_err(|_| EvidenceError::NotFound(call_id.to_string()))?;
        let envelope: EvidenceEnvelope = serde_json::from_str(&body)?;
        Ok(envelope)
    }

    /// Reload every evidence file from disk. Malformed entries are
    /// skipped with a warning, never fail the whole list.
    pub fn list(&self) -> Vec<EvidenceEnvelope> {
        debug!("EvidenceRecorder::list: called");
        let Ok(entries) = std::fs::read_dir(&self.llm_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path).ok().and_then(|s| serde_json::from_str::<EvidenceEnvelope>(&s).ok()) {
                Some(envelope) => out.push(envelope),
                None => warn!(?path, "EvidenceRecorder::list: skipping malformed evidence file"),
            }
        }
        out
    }

    /// At least one recorded evidence with `success = true` and a
    /// verifiable integrity hash.
    pub fn can_assert_complete(&self) -> bool {
        self.list().iter().any(|e| e.evidence.success && e.verify().unwrap_or(false))
    }

    /// Verified evidence entries whose `call_id` was minted for
    /// `run_id` (by the `<run_id>:<seq>` convention `CompletionProtocol`
    /// uses when recording each attempt).
    pub fn verified_for_run(&self, run_id: &str) -> Vec<LlmEvidence> {
        let prefix = format!("{run_id}:");
        self.list()
            .into_iter()
            .filter(|e| e.evidence.call_id.starts_with(&prefix) && e.verify().unwrap_or(false))
            .map(|e| e.evidence)
            .collect()
    }
}
