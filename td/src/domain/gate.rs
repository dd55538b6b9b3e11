//! QA gate results and the aggregated completion verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::run::RunId;

/// One gate's (passing, failing, skipped) triple for a single run.
///
/// Negative counts are nonsensical for a gate report; `normalised()`
/// coerces them to a single failure with a bounded penalty rather
/// than letting them silently offset the pass/fail arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaGateResult {
    pub gate_name: String,
    pub run_id: RunId,
    pub passing: i64,
    pub failing: i64,
    pub skipped: i64,
    pub timestamp: DateTime<Utc>,
}

impl QaGateResult {
    pub fn new(gate_name: impl Into<String>, run_id: RunId, passing: i64, failing: i64, skipped: i64) -> Self {
        Self {
            gate_name: gate_name.into(),
            run_id,
            passing,
            failing,
            skipped,
            timestamp: Utc::now(),
        }
    }

    /// Coerce negative counts: any negative field becomes 0 and the
    /// gate picks up one additional failure as a penalty marker.
    fn normalised(&self) -> (i64, i64, i64, bool) {
        let negative = self.passing < 0 || self.failing < 0 || self.skipped < 0;
        let passing = self.passing.max(0);
        let mut failing = self.failing.max(0);
        let skipped = self.skipped.max(0);
        if negative {
            failing += 1;
        }
        (passing, failing, skipped, negative)
    }
}

/// Final judgment on a task's completion, aggregated across gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Complete,
    Failing,
    NoEvidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionVerdict {
    pub final_status: FinalStatus,
    pub all_pass: bool,
    pub failing_total: i64,
    pub passing_total: i64,
    pub skipped_total: i64,
    pub failing_gates: Vec<String>,
    pub gate_summary: Vec<QaGateResult>,
    pub run_id: Option<RunId>,
    pub judged_at: DateTime<Utc>,
}

impl CompletionVerdict {
    fn no_evidence() -> Self {
        Self {
            final_status: FinalStatus::NoEvidence,
            all_pass: false,
            failing_total: 0,
            passing_total: 0,
            skipped_total: 0,
            failing_gates: Vec::new(),
            gate_summary: Vec::new(),
            run_id: None,
            judged_at: Utc::now(),
        }
    }
}

/// Aggregates `QaGateResult`s into a `CompletionVerdict`.
///
/// Empty gates is always `NO_EVIDENCE`. All gates must share one run
/// id (and, if a run id is currently bound, must match it) or judgment
/// aborts with a stale-run error rather than returning a verdict.
pub fn judge(gates: &[QaGateResult], current_run_id: Option<&RunId>) -> Result<CompletionVerdict, crate::error::CompletionError> {
    debug!(gate_count = gates.len(), ?current_run_id, "judge: called");
    if gates.is_empty() {
        return Ok(CompletionVerdict::no_evidence());
    }

    let distinct_run_ids: Vec<&RunId> = {
        let mut seen: Vec<&RunId> = Vec::new();
        for g in gates {
            if !seen.contains(&&g.run_id) {
                seen.push(&g.run_id);
            }
        }
        seen
    };

    if distinct_run_ids.len() > 1 {
        return Err(crate::error::CompletionError::MixedRunIds(
            distinct_run_ids.iter().map(|r| r.as_str().to_string()).collect(),
        ));
    }

    let gates_run_id = distinct_run_ids[0];
    if let Some(bound) = current_run_id
        && bound != gates_run_id
    {
        return Err(crate::error::CompletionError::StaleRun {
            gate_run_id: gates_run_id.as_str().to_string(),
            bound_run_id: bound.as_str().to_string(),
        });
    }

    let mut failing_total = 0i64;
    let mut passing_total = 0i64;
    let mut skipped_total = 0i64;
    let mut failing_gates = Vec::new();
    let mut any_negative_marker = false;

    for gate in gates {
        let (passing, failing, skipped, negative) = gate.normalised();
        passing_total += passing;
        failing_total += failing;
        skipped_total += skipped;
        if negative {
            any_negative_marker = true;
        }
        if failing > 0 {
            failing_gates.push(gate.gate_name.clone());
        }
    }

    let final_status = if failing_total > 0 || any_negative_marker {
        FinalStatus::Failing
    } else if passing_total > 0 {
        FinalStatus::Complete
    } else {
        FinalStatus::NoEvidence
    };

    Ok(CompletionVerdict {
        all_pass: final_status == FinalStatus::Complete,
        failing_total,
        passing_total,
        skipped_total,
        failing_gates,
        gate_summary: gates.to_vec(),
        run_id: Some(gates_run_id.clone()),
        judged_at: Utc::now(),
        final_status,
    })
}
