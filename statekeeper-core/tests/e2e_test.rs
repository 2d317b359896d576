// tests/e2e_test.rs
// End-to-end through the Commands facade: bootstrap, ingest, confirm,
// project, diagnose.
//
// Run with: cargo test -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use statekeeper_core::commands::Commands;
use statekeeper_core::services::pipeline::IngestStatus;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_root(name: &str) -> PathBuf {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let pid = std::process::id();
    let c = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("statekeeper_e2e_{pid}_{ns}_{c}_{name}"))
}

fn seeded_commands(name: &str) -> (PathBuf, Commands) {
    let root = tmp_root(name);
    fs::create_dir_all(&root).expect("mkdir root");
    fs::write(
        root.join("config.toml"),
        "[review]\ntarget = \"tg:777\"\n\n[system]\nentity_id = \"user:primary\"\n",
    )
    .expect("config");
    let cmds = Commands::open_at(&root).expect("commands");
    (root, cmds)
}

#[test]
fn bootstrap_creates_document_and_sibling_logs() {
    let (_root, cmds) = seeded_commands("bootstrap");
    let store = cmds.store();
    assert!(store.document_path().exists());
    assert!(store.audit_path().exists());
    assert!(store.dlq_path().exists());
    assert!(store.learning_events_path().exists());

    let doc = store.load().expect("load");
    assert_eq!(doc.version, 1);
    assert_eq!(doc.domains.len(), 7);
    assert!(doc.source_reliability.contains_key("user_confirmation"));
    assert_eq!(doc.runtime.projection_mode, "legacy_string");
    assert!(!doc.runtime.adaptive_learning_enabled);

    // document ends with a trailing newline (pretty JSON + \n)
    let raw = fs::read_to_string(store.document_path()).expect("raw");
    assert!(raw.ends_with('\n'));
}

#[test]
fn assertion_to_confirmation_to_projection() {
    let (root, cmds) = seeded_commands("flow");

    // A strong conversational fact commits straight away.
    let travel = json!({
        "event_id": "cf98a1b2-0000-4000-8000-000000000001",
        "event_ts": chrono::Utc::now().to_rfc3339(),
        "domain": "travel",
        "entity_id": "user:primary",
        "field": "travel.location",
        "candidate_value": "Tahoe",
        "intent": "assertive",
        "source": { "type": "conversation_assertive", "ref": "thread:1:msg:1" },
        "corroborators": []
    });
    let outcome = cmds.ingest(&travel, false).expect("ingest");
    assert_eq!(outcome.status, IngestStatus::Committed);
    assert_eq!(
        cmds.ingest(&travel, false).expect("ingest").status,
        IngestStatus::Duplicate
    );

    // Free text arrives through the extractor and waits for review.
    let extracted = cmds
        .ingest_text("Booked the flight to Tahoe for Friday", None, false)
        .expect("ingest_text");
    assert_eq!(extracted.status, IngestStatus::PendingConfirmation);
    let prompt_id = extracted.prompt_id.expect("prompt");

    // The human says yes via the control command.
    let reply = cmds
        .handle_command(&format!("{} yes", &prompt_id[..8]))
        .expect("command");
    assert!(reply.text.contains("Confirmed."));

    // The command handler already projected after the commit; explicit runs
    // are byte-identical no-ops from here.
    let artifact = root.join("STATE.md");
    assert!(artifact.exists());
    let bytes = fs::read(&artifact).expect("artifact");
    let again = cmds.project().expect("project");
    assert!(!again.wrote);
    assert_eq!(fs::read(&artifact).expect("artifact"), bytes);

    let text = String::from_utf8(bytes).expect("utf8");
    assert!(text.contains("travel.location = Tahoe"));
    assert!(text.contains("travel.note = Booked the flight to Tahoe for Friday"));
    assert!(text.contains("source=user_confirmation"));

    // Counters and invariants line up.
    let stats = cmds.stats().expect("stats");
    assert_eq!(stats.committed_records, 2);
    assert_eq!(stats.pending_confirmations, 0);
    assert_eq!(stats.learning_stats.auto_commits, 1);
    assert_eq!(stats.learning_stats.user_confirms, 1);

    let consistency = cmds.verify_consistency().expect("verify");
    assert!(consistency.ok, "violations: {:?}", consistency.violations);
}

#[test]
fn doctor_reports_green_on_a_healthy_root() {
    let (_root, cmds) = seeded_commands("doctor");
    let report = cmds.doctor().expect("doctor");
    assert!(report.ok, "checks: {:?}", report.checks);
}

#[test]
fn doctor_flags_a_missing_chat_target() {
    let root = tmp_root("doctor_target");
    let cmds = Commands::open_at(&root).expect("commands");
    let report = cmds.doctor().expect("doctor");
    let target_check = report
        .checks
        .iter()
        .find(|c| c.name == "chat_target")
        .expect("check");
    assert!(!target_check.ok);
    assert!(target_check.hint.as_deref().unwrap_or("").contains("STATE_TELEGRAM_TARGET"));
}

#[test]
fn learner_stays_gated_off_by_default() {
    let (_root, cmds) = seeded_commands("gated");
    let report = cmds.learner_run(true).expect("learner");
    assert_eq!(report.mode, "off");
    assert_eq!(report.skipped.as_deref(), Some("mode=off"));
}

#[test]
fn poll_pass_ingests_fetcher_output_and_repolls_clean() {
    let root = tmp_root("poll");
    fs::create_dir_all(&root).expect("mkdir root");
    fs::write(
        root.join("config.toml"),
        concat!(
            "[poller]\n",
            "calendar_cmd = 'echo [{\"id\":\"evt-1\",\"summary\":\"Flight to Tahoe\",\"start\":\"2026-02-22T07:00:00-08:00\"}]'\n",
        ),
    )
    .expect("config");
    let cmds = Commands::open_at(&root).expect("commands");

    let first = cmds.poll_signals().expect("poll");
    let calendar = first.calendar.expect("calendar summary");
    assert_eq!(calendar.status, "ok");
    // calendar_poll reliability keeps a planning item in the review band
    assert_eq!(calendar.pending, 1);
    assert_eq!(calendar.duplicates, 0);
    assert!(first.email.is_none());

    let second = cmds.poll_signals().expect("repoll");
    let calendar = second.calendar.expect("calendar summary");
    assert_eq!(calendar.duplicates, 1);
    assert_eq!(calendar.pending, 0);

    let doc = cmds.store().load().expect("load");
    assert!(doc.runtime.last_poll_at.is_some());
    assert_eq!(doc.pending_confirmations.len(), 1);
}

#[test]
fn review_queue_via_facade_uses_configured_caps() {
    let (_root, cmds) = seeded_commands("review");
    let outcome = cmds
        .promote_review_queue(Some("user:primary".to_string()), None)
        .expect("promote");
    assert_eq!(outcome.promoted_count, 0);
    assert_eq!(outcome.reason.as_deref(), Some("no_eligible_tentatives"));
}
