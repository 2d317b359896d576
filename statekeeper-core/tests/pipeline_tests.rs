// tests/pipeline_tests.rs
// Ingestion pipeline: decisions, idempotency, retraction, quarantine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use schemas::SchemaSet;
use statekeeper_core::services::dlq;
use statekeeper_core::services::pipeline::{self, IngestOptions, IngestStatus};
use statekeeper_core::services::store::StateStore;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_store(name: &str) -> StateStore {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let pid = std::process::id();
    let c = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("statekeeper_pipeline_{pid}_{ns}_{c}_{name}"));
    StateStore::open(dir)
}

fn schemas() -> SchemaSet {
    SchemaSet::compile().expect("schemas compile")
}

fn observation(event_id: &str, field: &str, value: Value, source_type: &str) -> Value {
    json!({
        "event_id": event_id,
        "event_ts": chrono::Utc::now().to_rfc3339(),
        "domain": "travel",
        "entity_id": "user:primary",
        "field": field,
        "candidate_value": value,
        "intent": "assertive",
        "source": { "type": source_type, "ref": "thread:1:msg:1" },
        "corroborators": []
    })
}

const EV1: &str = "cf98a1b2-0000-4000-8000-000000000001";
const EV2: &str = "cf98a1b2-0000-4000-8000-000000000002";

#[test]
fn high_confidence_commit_then_duplicate() {
    let store = tmp_store("s1");
    let s = schemas();
    let payload = observation(EV1, "travel.location", json!("Tahoe"), "conversation_assertive");

    let first = pipeline::ingest(&store, &s, &payload, &IngestOptions::default()).expect("ingest");
    assert_eq!(first.status, IngestStatus::Committed);
    assert_eq!(first.confidence, Some(0.92));

    let doc = store.load().expect("load");
    let record = doc
        .record("user:primary", "travel", "location")
        .expect("record");
    assert_eq!(record.value, json!("Tahoe"));
    assert_eq!(record.source, "conversation_assertive");
    assert!(doc.is_processed(EV1));

    let second = pipeline::ingest(&store, &s, &payload, &IngestOptions::default()).expect("ingest");
    assert_eq!(second.status, IngestStatus::Duplicate);

    // one audit line for the commit, none for the duplicate
    let audit = store.audit_tail(10).expect("audit");
    assert_eq!(audit.len(), 1);
    assert!(audit[0].contains("decision=auto_commit"));
}

#[test]
fn ask_band_creates_prompt_and_tentative_stashes() {
    let store = tmp_store("bands");
    let s = schemas();

    let asked = pipeline::ingest(
        &store,
        &s,
        &observation(EV1, "travel.alert", json!("Leave Friday"), "static_markdown"),
        &IngestOptions::default(),
    )
    .expect("ingest");
    // static_markdown at 0.60 sits exactly on the ask threshold
    assert_eq!(asked.status, IngestStatus::PendingConfirmation);
    let prompt_id = asked.prompt_id.expect("prompt id");

    let mut low = observation(EV2, "travel.idea", json!("Maybe Tahoe"), "static_markdown");
    low["intent"] = json!("hypothetical");
    let stashed = pipeline::ingest(&store, &s, &low, &IngestOptions::default()).expect("ingest");
    assert_eq!(stashed.status, IngestStatus::Tentative);

    let doc = store.load().expect("load");
    assert!(doc.pending_confirmations.contains_key(&prompt_id));
    assert_eq!(doc.tentative_observations.len(), 1);
    assert_eq!(doc.learning_stats.ask_user_prompts, 1);
    assert_eq!(doc.learning_stats.tentative_rejects, 1);
    // neither path committed anything
    assert_eq!(doc.committed_record_count(), 0);
    // but both event ids are burned
    assert!(doc.is_processed(EV1));
    assert!(doc.is_processed(EV2));
}

#[test]
fn retract_deletes_and_is_involutive() {
    let store = tmp_store("retract");
    let s = schemas();

    let before = store.load().expect("load").entities.clone();

    pipeline::ingest(
        &store,
        &s,
        &observation(EV1, "travel.location", json!("Tahoe"), "conversation_assertive"),
        &IngestOptions::default(),
    )
    .expect("commit");

    // The margin rule shields the committed record from anything weaker, so
    // a same-source retract routes to ask_user; force it through instead.
    let mut retract = observation(EV2, "travel.location", json!(null), "conversation_assertive");
    retract["intent"] = json!("retract");
    let opts = IngestOptions {
        force_commit: true,
        ..IngestOptions::default()
    };
    let outcome = pipeline::ingest(&store, &s, &retract, &opts).expect("retract");
    assert_eq!(outcome.status, IngestStatus::Committed);

    let doc = store.load().expect("load");
    assert!(doc.record("user:primary", "travel", "location").is_none());
    assert_eq!(doc.entities, before, "retract leaves the store as never-committed");
}

#[test]
fn invalid_payload_is_quarantined() {
    let store = tmp_store("invalid");
    let s = schemas();

    let payload = json!({ "event_id": "not-a-uuid", "surprise": true });
    let outcome = pipeline::ingest(&store, &s, &payload, &IngestOptions::default()).expect("ingest");
    assert_eq!(outcome.status, IngestStatus::ValidationFailed);
    assert!(!outcome.errors.is_empty());
    let dlq_id = outcome.dlq_id.expect("dlq id");

    let fold = dlq::fold(&store).expect("fold");
    let entry = fold.entries.get(&dlq_id).expect("entry");
    assert_eq!(entry.status, "pending_retry");
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.schema_name, "observation");

    // nothing touched the document
    let doc = store.load().expect("load");
    assert_eq!(doc.committed_record_count(), 0);
    assert!(doc.processed_event_ids.is_empty());
}

#[test]
fn force_commit_overrides_the_gate() {
    let store = tmp_store("force");
    let s = schemas();

    let mut low = observation(EV1, "travel.idea", json!("Maybe Tahoe"), "static_markdown");
    low["intent"] = json!("hypothetical");
    let opts = IngestOptions {
        force_commit: true,
        ..IngestOptions::default()
    };
    let outcome = pipeline::ingest(&store, &s, &low, &opts).expect("ingest");
    assert_eq!(outcome.status, IngestStatus::Committed);
    assert_eq!(outcome.reasons, vec!["force_commit=true".to_string()]);

    let doc = store.load().expect("load");
    assert!(doc.record("user:primary", "travel", "idea").is_some());
}

#[test]
fn lower_confidence_does_not_displace_committed_record() {
    let store = tmp_store("margin");
    let s = schemas();

    pipeline::ingest(
        &store,
        &s,
        &observation(EV1, "travel.location", json!("Tahoe"), "conversation_assertive"),
        &IngestOptions::default(),
    )
    .expect("commit");

    // A markdown claim (0.60) against a 0.92 record: ask band, no overwrite.
    let challenger = observation(EV2, "travel.location", json!("Denver"), "static_markdown");
    let outcome =
        pipeline::ingest(&store, &s, &challenger, &IngestOptions::default()).expect("ingest");
    assert_eq!(outcome.status, IngestStatus::PendingConfirmation);

    let doc = store.load().expect("load");
    assert_eq!(
        doc.record("user:primary", "travel", "location").expect("record").value,
        json!("Tahoe")
    );
}
