//! LLM call evidence: the sealed, hash-verified proof that an executor
//! invocation actually happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One LLM call attempt, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmEvidence {
    pub call_id: String,
    pub provider: String,
    pub model: String,
    pub request_hash: String,
    pub response_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Evidence wrapped with an integrity hash computed over the
/// canonical JSON of `evidence`, so tampering (or partial writes) is
/// detectable on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEnvelope {
    pub evidence: LlmEvidence,
    pub integrity_hash: String,
}

impl EvidenceEnvelope {
    /// Seal `evidence` into an envelope, computing `integrity_hash`
    /// over its canonical (key-sorted) JSON representation.
    pub fn seal(evidence: LlmEvidence) -> Result<Self, serde_json::Error> {
        let integrity_hash = canonical_hash(&evidence)?;
        Ok(Self { evidence, integrity_hash })
    }

    /// Recompute the integrity hash from `evidence` and compare it
    /// against the stored one.
    pub fn verify(&self) -> Result<bool, serde_json::Error> {
        let recomputed = canonical_hash(&self.evidence)?;
        Ok(recomputed == self.integrity_hash)
    }
}

/// Canonical hash: serialise through a key-sorted `serde_json::Map`
/// before hashing, so field ordering in the source struct never
/// changes the hash. Prefixed `sha256:` to match the request/response
/// hash convention used elsewhere.
fn canonical_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let canonical = canonicalize(&value);
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Recursively re-key every object into a `BTreeMap` so serialisation
/// order is determined by key, not insertion order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// `sha256:`-prefixed hash of arbitrary text, used for response
/// hashes (the response is plain text, not a JSON document needing
/// key-order independence).
pub fn sha256_prefixed(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// `request_hash`: sha256 of the canonical JSON of the ordered
/// messages array sent to the executor (`[{"role": .., "content":
/// ..}]`), per §3/§4.5 — not a hash of the raw prompt string.
pub fn request_hash(role: &str, content: &str) -> String {
    let messages = serde_json::json!([{ "role": role, "content": content }]);
    canonical_hash(&messages).unwrap_or_else(|_| sha256_prefixed(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence() -> LlmEvidence {
        LlmEvidence {
            call_id: "call-1".to_string(),
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4".to_string(),
            request_hash: sha256_prefixed("{}"),
            response_hash: Some(sha256_prefixed("ok")),
            timestamp: Utc::now(),
            duration_ms: 42,
            success: true,
            error: None,
        }
    }

    #[test]
    fn seal_then_verify_round_trips() {
        let env = EvidenceEnvelope::seal(evidence()).unwrap();
        assert!(env.verify().unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        let mut env = EvidenceEnvelope::seal(evidence()).unwrap();
        env.evidence.success = false;
        assert!(!env.verify().unwrap());
    }

    #[test]
    fn hash_is_stable_regardless_of_struct_field_order_in_json() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        let ha = canonical_hash(&a).unwrap();
        let hb = canonical_hash(&b).unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn sha256_prefixed_has_expected_shape() {
        let h = sha256_prefixed("hello");
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
    }

    #[test]
    fn request_hash_differs_from_raw_text_hash() {
        let content = "do the thing";
        assert_ne!(request_hash("user", content), sha256_prefixed(content));
    }

    #[test]
    fn request_hash_is_stable_for_the_same_role_and_content() {
        let a = request_hash("user", "same content");
        let b = request_hash("user", "same content");
        assert_eq!(a, b);
    }
}
