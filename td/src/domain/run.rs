//! Run identity.
//!
//! A `RunId` identifies one attempt at satisfying a task. The format
//! `YYYYMMDD-HHmmss-mmm-<7-hex-sha>-<8-hex-cmdhash>` is monotonic per
//! wall clock and lexicographically comparable: two run ids minted in
//! the same millisecond still compare by their random suffix, so
//! sorting `RunId` values never needs to parse them.

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// A time-ordered, lexicographically comparable run identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an existing string without validating its shape. Used when
    /// deserialising records whose run id was minted by a prior process.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Mint a fresh `RunId` for a new attempt.
///
/// `command_seed` ties the `cmdhash` suffix to the work being attempted
/// (the task's prompt, typically) so two runs of the same task share a
/// recognisable suffix even when the random `sha` fragment differs.
pub fn new_run_id(command_seed: &str) -> RunId {
    let now = Utc::now();
    let mut rng = rand::rng();
    let nonce = rng.next_u64();

    let mut sha_input = Sha256::new();
    sha_input.update(now.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    sha_input.update(nonce.to_le_bytes());
    let sha_digest = format!("{:x}", sha_input.finalize());

    let mut cmd_input = Sha256::new();
    cmd_input.update(command_seed.as_bytes());
    let cmd_digest = format!("{:x}", cmd_input.finalize());

    let id = format!(
        "{}-{:03}-{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        now.timestamp_subsec_millis(),
        &sha_digest[..7],
        &cmd_digest[..8],
    );
    debug!(%id, "new_run_id: minted");
    RunId(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_has_expected_shape() {
        let id = new_run_id("task-1");
        let s = id.as_str();
        let parts: Vec<&str> = s.split('-').collect();
        // YYYYMMDD, HHmmss, mmm, 7-hex-sha, 8-hex-cmdhash
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 3);
        assert_eq!(parts[3].len(), 7);
        assert_eq!(parts[4].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[4].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_seed_shares_cmdhash_suffix_but_not_whole_id() {
        let a = new_run_id("task-1");
        let b = new_run_id("task-1");
        assert_ne!(a, b);
        let a_cmdhash = a.as_str().rsplit('-').next().unwrap();
        let b_cmdhash = b.as_str().rsplit('-').next().unwrap();
        assert_eq!(a_cmdhash, b_cmdhash);
    }

    #[test]
    fn different_seeds_produce_different_cmdhash() {
        let a = new_run_id("task-1");
        let b = new_run_id("task-2");
        let a_cmdhash = a.as_str().rsplit('-').next().unwrap();
        let b_cmdhash = b.as_str().rsplit('-').next().unwrap();
        assert_ne!(a_cmdhash, b_cmdhash);
    }

    #[test]
    fn run_ids_are_lexicographically_ordered_by_mint_time() {
        let a = new_run_id("seed");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = new_run_id("seed");
        assert!(a.as_str()[..15] <= b.as_str()[..15]);
    }
}
