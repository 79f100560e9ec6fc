use std::collections::HashSet;

use swarmq::audit::{digest_signatures, verify_records, AuditLog};
use swarmq::envelope::VoteContent;

fn seeded_log() -> AuditLog {
    let log = AuditLog::new();
    log.append("s1", "a1", r#"{"choice":"A","confidence":0.9}"#, 1_000);
    log.append("s1", "a2", r#"{"choice":"B","confidence":0.4}"#, 1_050);
    log.append("s1", "a3", r#"{"rankings":["B","A"]}"#, 1_100);
    log
}

#[test]
fn untampered_sessions_verify() {
    let log = seeded_log();
    assert!(log.verify("s1").is_ok());
    // An unknown session has nothing to falsify.
    assert!(log.verify("does-not-exist").is_ok());
}

#[test]
fn every_field_mutation_breaks_verification() {
    let log = seeded_log();
    let pristine = log.records("s1");
    assert!(verify_records(&pristine).is_ok());

    let mut tampered = pristine.clone();
    tampered[1].agent_id = "impostor".into();
    assert!(verify_records(&tampered).is_err());

    let mut tampered = pristine.clone();
    tampered[1].vote = r#"{"choice":"A","confidence":0.4}"#.into();
    assert!(verify_records(&tampered).is_err());

    let mut tampered = pristine.clone();
    tampered[1].recorded_at += 1;
    assert!(verify_records(&tampered).is_err());

    let mut tampered = pristine.clone();
    tampered[1].signature = tampered[0].signature.clone();
    assert!(verify_records(&tampered).is_err());

    // Dropping a middle record breaks the chain of its successor.
    let mut truncated = pristine.clone();
    truncated.remove(1);
    assert!(verify_records(&truncated).is_err());
}

#[test]
fn record_signature_recomputes_from_encoded_vote() {
    // Encode a vote, append, and confirm the stored signature is exactly the
    // one verification derives — the audit round-trip law.
    let content = VoteContent::Choice {
        choice: "A".into(),
        confidence: 0.75,
    };
    let encoded = serde_json::to_string(&content).unwrap();

    let log = AuditLog::new();
    let record = log.append("s", "a1", encoded, 42);
    assert!(verify_records(&log.records("s")).is_ok());
    assert_eq!(log.records("s")[0].signature, record.signature);
}

#[test]
fn session_digest_is_order_insensitive_but_content_sensitive() {
    let log = seeded_log();
    let records = log.records("s1");
    let digest = digest_signatures(&records);

    let mut shuffled = records.clone();
    shuffled.rotate_left(1);
    assert_eq!(digest_signatures(&shuffled), digest);

    let other = AuditLog::new();
    other.append("s1", "a1", r#"{"choice":"A","confidence":0.9}"#, 1_001);
    assert_ne!(other.session_digest("s1").unwrap(), digest);
}

#[test]
fn record_ids_are_unique_and_sessions_are_isolated() {
    let log = AuditLog::new();
    let mut seen = HashSet::new();
    for i in 0..50i64 {
        let record = log.append("s1", format!("agent-{}", i % 7), "{}", i);
        assert!(seen.insert(record.record_id));
    }
    log.append("s2", "a1", "{}", 1);
    assert_eq!(log.records("s1").len(), 50);
    assert_eq!(log.records("s2").len(), 1);
    assert!(log.verify("s1").is_ok());
    assert!(log.verify("s2").is_ok());
}
