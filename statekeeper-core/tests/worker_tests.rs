// tests/worker_tests.rs
// Confirmation-loop worker: dispatch, reply handling, cursor semantics.

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use schemas::SchemaSet;
use statekeeper_core::config::EngineConfig;
use statekeeper_core::services::pipeline::{self, IngestOptions, IngestStatus};
use statekeeper_core::services::store::StateStore;
use statekeeper_core::services::worker::{self, Button, ChatTransport};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_root(name: &str) -> PathBuf {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let pid = std::process::id();
    let c = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("statekeeper_worker_{pid}_{ns}_{c}_{name}"))
}

fn schemas() -> SchemaSet {
    SchemaSet::compile().expect("schemas compile")
}

struct Harness {
    root: PathBuf,
    store: StateStore,
    config: EngineConfig,
}

fn harness(name: &str) -> Harness {
    let root = tmp_root(name);
    let store = StateStore::open(root.join("memory"));
    let mut config = EngineConfig::default();
    config.review.target = Some("tg:777".to_string());
    config.paths.memory_dir = root.join("memory");
    config.paths.artifact = root.join("STATE.md");
    config.paths.sessions_dir = root.join("sessions");
    Harness { root, store, config }
}

#[derive(Default)]
struct RecordingTransport {
    sent: RefCell<Vec<(String, String, usize)>>,
}

impl ChatTransport for RecordingTransport {
    fn send(&self, target: &str, text: &str, buttons: &[Button]) -> anyhow::Result<String> {
        let mut sent = self.sent.borrow_mut();
        sent.push((target.to_string(), text.to_string(), buttons.len()));
        Ok(format!("msg-{}", sent.len()))
    }
}

fn seed_pending(store: &StateStore, s: &SchemaSet, n: u32, field: &str, value: &str) -> String {
    let payload = json!({
        "event_id": format!("cf98a1b2-0000-4000-8000-{n:012}"),
        "event_ts": chrono::Utc::now().to_rfc3339(),
        "domain": "travel",
        "entity_id": "user:primary",
        "field": field,
        "candidate_value": value,
        "intent": "assertive",
        "source": { "type": "static_markdown", "ref": "notes.md" },
        "corroborators": []
    });
    let outcome = pipeline::ingest(store, s, &payload, &IngestOptions::default()).expect("ingest");
    assert_eq!(outcome.status, IngestStatus::PendingConfirmation);
    outcome.prompt_id.expect("prompt id")
}

fn write_user_reply(root: &PathBuf, line_id: &str, text: &str) {
    let dir = root.join("sessions");
    fs::create_dir_all(&dir).expect("mkdir sessions");
    let path = dir.join("session-tg_777.jsonl");
    let line = json!({
        "id": line_id,
        "ts": chrono::Utc::now().to_rfc3339(),
        "role": "user",
        "text": text
    });
    let mut existing = fs::read_to_string(&path).unwrap_or_default();
    existing.push_str(&line.to_string());
    existing.push('\n');
    fs::write(&path, existing).expect("write session");
}

#[test]
fn happy_path_dispatch_then_confirm_then_idle() {
    let h = harness("happy");
    let s = schemas();
    let transport = RecordingTransport::default();

    let prompt_id = seed_pending(&h.store, &s, 1, "travel.alert", "Leave for Tahoe Friday");

    // Tick 1: dispatch with Yes/No buttons.
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");
    assert_eq!(report.dispatched_prompt_id.as_deref(), Some(prompt_id.as_str()));
    {
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tg:777");
        assert!(sent[0].1.contains("Confirm state change"));
        assert_eq!(sent[0].2, 2);
    }
    let state = worker::load_worker_state(&h.store).expect("state");
    assert_eq!(state.active_prompt_id.as_deref(), Some(prompt_id.as_str()));
    assert!(state.last_dispatched_at.is_some());

    // Tick 2 after a "yes": decision applied, store committed, active cleared.
    write_user_reply(&h.root, "m1", "yes");
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert_eq!(report.decision_status.as_deref(), Some("committed"));
    assert!(report.dispatched_prompt_id.is_none());

    let doc = h.store.load().expect("load");
    let record = doc.record("user:primary", "travel", "alert").expect("record");
    assert_eq!(record.value, json!("Leave for Tahoe Friday"));
    assert_eq!(record.source, "user_confirmation");

    let state = worker::load_worker_state(&h.store).expect("state");
    assert!(state.active_prompt_id.is_none());
    assert!(state.last_decision_at.is_some());

    // ack + "Context synced." follow-up landed
    {
        let sent = transport.sent.borrow();
        assert!(sent.iter().any(|(_, text, _)| text.contains("Confirmed")));
        assert!(sent.iter().any(|(_, text, _)| text == "Context synced."));
    }

    // Tick 3: nothing pending, nothing dispatched.
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 3");
    assert!(report.dispatched_prompt_id.is_none());
    assert!(report.decision_status.is_none());
}

#[test]
fn reject_reply_leaves_state_untouched() {
    let h = harness("reject");
    let s = schemas();
    let transport = RecordingTransport::default();

    seed_pending(&h.store, &s, 2, "travel.alert", "Leave Friday");
    worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");

    write_user_reply(&h.root, "m1", "no");
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert_eq!(report.decision_status.as_deref(), Some("rejected"));

    let doc = h.store.load().expect("load");
    assert_eq!(doc.committed_record_count(), 0);
    assert!(doc.pending_confirmations.is_empty());
}

#[test]
fn edit_reply_commits_the_new_value() {
    let h = harness("edit");
    let s = schemas();
    let transport = RecordingTransport::default();

    seed_pending(&h.store, &s, 3, "travel.alert", "Leave Friday");
    worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");

    write_user_reply(&h.root, "m1", "edit: Leave Saturday");
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert_eq!(report.decision_status.as_deref(), Some("committed"));

    let doc = h.store.load().expect("load");
    let record = doc.record("user:primary", "travel", "alert").expect("record");
    assert_eq!(record.value, json!("Leave Saturday"));
}

#[test]
fn bare_edit_sends_usage_hint_without_resolving() {
    let h = harness("edithelp");
    let s = schemas();
    let transport = RecordingTransport::default();

    let prompt_id = seed_pending(&h.store, &s, 4, "travel.alert", "Leave Friday");
    worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");

    write_user_reply(&h.root, "m1", "edit");
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert!(report.decision_status.is_none());

    let state = worker::load_worker_state(&h.store).expect("state");
    assert_eq!(state.active_prompt_id.as_deref(), Some(prompt_id.as_str()));
    let sent = transport.sent.borrow();
    assert!(sent.iter().any(|(_, text, _)| text.contains("To edit")));
}

#[test]
fn replies_naming_a_different_prompt_are_ignored() {
    let h = harness("foreign");
    let s = schemas();
    let transport = RecordingTransport::default();

    let prompt_id = seed_pending(&h.store, &s, 5, "travel.alert", "Leave Friday");
    worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");

    write_user_reply(&h.root, "m1", "confirm deadbeef-0000-4000-8000-000000000000");
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert!(report.decision_status.is_none());

    let state = worker::load_worker_state(&h.store).expect("state");
    assert_eq!(state.active_prompt_id.as_deref(), Some(prompt_id.as_str()));
}

#[test]
fn chatter_before_dispatch_never_resolves_the_new_prompt() {
    let h = harness("cursor");
    let s = schemas();
    let transport = RecordingTransport::default();

    // Old chatter lands before any prompt exists.
    write_user_reply(&h.root, "m0", "ok");

    let prompt_id = seed_pending(&h.store, &s, 6, "travel.alert", "Leave Friday");
    // Tick 1 reads (and discards) the backlog, then dispatches.
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 1");
    assert_eq!(report.dispatched_prompt_id.as_deref(), Some(prompt_id.as_str()));

    // Tick 2 with no new messages: the old "ok" must not confirm anything.
    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick 2");
    assert!(report.decision_status.is_none());
    let state = worker::load_worker_state(&h.store).expect("state");
    assert_eq!(state.active_prompt_id.as_deref(), Some(prompt_id.as_str()));
}

#[test]
fn stale_active_prompt_clears_itself() {
    let h = harness("stale");
    let s = schemas();
    let transport = RecordingTransport::default();

    let mut state = worker::load_worker_state(&h.store).expect("state");
    state.entity_id = "user:primary".to_string();
    state.active_prompt_id = Some("00000000-0000-4000-8000-00000000dead".to_string());
    worker::save_worker_state(&h.store, &state).expect("save");

    let report = worker::tick(&h.store, &s, &h.config, &transport).expect("tick");
    assert!(report.decision_status.is_none());
    let state = worker::load_worker_state(&h.store).expect("state");
    assert!(state.active_prompt_id.is_none());
}

#[test]
fn missing_target_is_a_quiet_noop() {
    let h = harness("notarget");
    let s = schemas();
    let transport = RecordingTransport::default();

    let mut config = h.config.clone();
    config.review.target = None;
    let report = worker::tick(&h.store, &s, &config, &transport).expect("tick");
    assert!(report.notes.contains(&"no_target".to_string()));
    assert!(transport.sent.borrow().is_empty());
}
