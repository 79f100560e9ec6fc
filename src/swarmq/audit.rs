//! Tamper-evident audit trail for accepted ballots.
//!
//! Every ballot a voting session accepts generates an [`AuditRecord`] whose
//! `signature` is a SHA-256 digest over the record's canonical fields chained
//! to the previous record's signature. Editing any field of any record — or
//! reordering records — changes at least one recomputed signature, which
//! [`verify_records`] detects.
//!
//! # Architecture
//!
//! ```text
//! AuditLog (per-session, append-only)
//!   ├─ Record #0  agent=a1  sig=9fd1...   prev=""
//!   ├─ Record #1  agent=a2  sig=02bc...   prev=9fd1...
//!   └─ Record #2  agent=a1  sig=77e0...   prev=02bc...
//!
//! session digest = sha256(sorted(sig0, sig1, sig2) joined by "|")
//! ```
//!
//! The canonical signature input is
//! `agent_id|vote_json|timestamp_ms|prev_signature` joined by pipe
//! characters, so any change to any field produces a different digest.
//!
//! # Example
//!
//! ```rust
//! use swarmq::audit::AuditLog;
//!
//! let log = AuditLog::new();
//! log.append("session-1", "agent-a", r#"{"choice":"A","confidence":0.9}"#, 1_722_470_400_000);
//! log.append("session-1", "agent-b", r#"{"choice":"B","confidence":0.4}"#, 1_722_470_400_050);
//!
//! assert!(log.verify("session-1").is_ok());
//! assert!(log.session_digest("session-1").is_some());
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::swarmq::error::SwarmError;

/// Immutable signed record of one accepted ballot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    /// Globally unique record id.
    pub record_id: String,
    pub session_id: String,
    pub agent_id: String,
    /// Canonical JSON serialization of the ballot content.
    pub vote: String,
    /// Unix ms when the ballot was accepted.
    pub recorded_at: i64,
    /// SHA-256 hex digest binding the preceding fields and the previous
    /// record's signature.
    pub signature: String,
}

/// Append-only, per-session audit store. Lives for the process lifetime
/// unless explicitly [`reset`](AuditLog::reset).
#[derive(Debug, Default)]
pub struct AuditLog {
    sessions: Mutex<HashMap<String, Vec<AuditRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a signed record for an accepted ballot and return a copy of it.
    ///
    /// Appends within a session are totally ordered; the record's signature
    /// chains to the session's current tail.
    pub fn append(
        &self,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        vote_json: impl Into<String>,
        recorded_at: i64,
    ) -> AuditRecord {
        let session_id = session_id.into();
        let agent_id = agent_id.into();
        let vote = vote_json.into();

        let mut sessions = self.sessions.lock().expect("audit log lock poisoned");
        let records = sessions.entry(session_id.clone()).or_insert_with(Vec::new);
        let prev_signature = records
            .last()
            .map(|r| r.signature.clone())
            .unwrap_or_default();

        let record = AuditRecord {
            record_id: Uuid::new_v4().to_string(),
            session_id,
            agent_id: agent_id.clone(),
            vote: vote.clone(),
            recorded_at,
            signature: compute_signature(&agent_id, &vote, recorded_at, &prev_signature),
        };
        records.push(record.clone());
        record
    }

    /// Copy of a session's records in append order.
    pub fn records(&self, session_id: &str) -> Vec<AuditRecord> {
        self.sessions
            .lock()
            .expect("audit log lock poisoned")
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deterministic digest over the session's signatures, or `None` for an
    /// unknown or empty session.
    pub fn session_digest(&self, session_id: &str) -> Option<String> {
        let records = self.records(session_id);
        if records.is_empty() {
            None
        } else {
            Some(digest_signatures(&records))
        }
    }

    /// Recompute every signature in the session and compare. Any mismatch is
    /// an [`SwarmError::Integrity`] naming the offending record.
    pub fn verify(&self, session_id: &str) -> Result<(), SwarmError> {
        verify_records(&self.records(session_id))
    }

    /// Drop every session. Only for embedders that explicitly recycle state.
    pub fn reset(&self) {
        self.sessions
            .lock()
            .expect("audit log lock poisoned")
            .clear();
    }
}

/// Recompute each record's chained signature and compare with the stored one.
pub fn verify_records(records: &[AuditRecord]) -> Result<(), SwarmError> {
    let mut prev_signature = String::new();
    for record in records {
        let expected = compute_signature(
            &record.agent_id,
            &record.vote,
            record.recorded_at,
            &prev_signature,
        );
        if expected != record.signature {
            return Err(SwarmError::Integrity(format!(
                "signature mismatch for record {} in session {}",
                record.record_id, record.session_id
            )));
        }
        prev_signature = record.signature.clone();
    }
    Ok(())
}

/// Session digest: SHA-256 over the lexicographically sorted member
/// signatures.
pub fn digest_signatures(records: &[AuditRecord]) -> String {
    let mut signatures: Vec<&str> = records.iter().map(|r| r.signature.as_str()).collect();
    signatures.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(signatures.join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn compute_signature(agent_id: &str, vote: &str, recorded_at: i64, prev_signature: &str) -> String {
    let canonical = format!("{}|{}|{}|{}", agent_id, vote, recorded_at, prev_signature);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_order_is_preserved() {
        let log = AuditLog::new();
        log.append("s", "a1", "{}", 1);
        log.append("s", "a2", "{}", 2);
        log.append("s", "a3", "{}", 3);

        let agents: Vec<String> = log.records("s").into_iter().map(|r| r.agent_id).collect();
        assert_eq!(agents, vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn digest_is_deterministic() {
        let log = AuditLog::new();
        log.append("s", "a1", r#"{"choice":"A"}"#, 10);
        log.append("s", "a2", r#"{"choice":"B"}"#, 20);
        assert_eq!(log.session_digest("s"), log.session_digest("s"));
    }

    #[test]
    fn tampered_vote_fails_verification() {
        let log = AuditLog::new();
        log.append("s", "a1", r#"{"choice":"A"}"#, 10);
        log.append("s", "a2", r#"{"choice":"B"}"#, 20);

        let mut records = log.records("s");
        records[0].vote = r#"{"choice":"B"}"#.into();
        let err = verify_records(&records).unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
    }

    #[test]
    fn reordered_records_fail_verification() {
        let log = AuditLog::new();
        log.append("s", "a1", r#"{"choice":"A"}"#, 10);
        log.append("s", "a2", r#"{"choice":"B"}"#, 20);

        let mut records = log.records("s");
        records.swap(0, 1);
        assert!(verify_records(&records).is_err());
    }
}
