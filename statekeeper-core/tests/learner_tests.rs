// tests/learner_tests.rs
// Threshold learner: gating, throttle, shadow vs apply, clamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use statekeeper_core::config::{AdaptiveConfig, AdaptiveMode};
use statekeeper_core::services::learner::{self, LearnerOptions, LearningEvent};
use statekeeper_core::services::store::StateStore;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_store(name: &str) -> StateStore {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let pid = std::process::id();
    let c = COUNTER.fetch_add(1, Ordering::Relaxed);
    StateStore::open(std::env::temp_dir().join(format!("statekeeper_learner_{pid}_{ns}_{c}_{name}")))
}

fn event(n: u32, action: &str, confidence: f64) -> LearningEvent {
    LearningEvent {
        learning_event_id: format!("aaaa0000-0000-4000-8000-{n:012}"),
        ts: chrono::Utc::now().to_rfc3339(),
        entity_id: "user:primary".to_string(),
        domain: "travel".to_string(),
        field: "travel.alert".to_string(),
        decision: "ask_user".to_string(),
        action: action.to_string(),
        outcome: if action == "confirm" { "accepted" } else { "corrected" }.to_string(),
        confidence,
        intent: "assertive".to_string(),
        source_type: "static_markdown".to_string(),
        source_ref: "notes.md".to_string(),
        prompt_id: format!("bbbb0000-0000-4000-8000-{n:012}"),
    }
}

fn seed_mixed_outcomes(store: &StateStore) {
    // 11 confirms, 3 corrections: correction_rate ~0.21 pushes auto up.
    let mut n = 0;
    for _ in 0..11 {
        learner::append_event(store, &event(n, "confirm", 0.75)).expect("append");
        n += 1;
    }
    for confidence in [0.84, 0.86, 0.88] {
        learner::append_event(store, &event(n, "reject", confidence)).expect("append");
        n += 1;
    }
}

fn adaptive(mode: AdaptiveMode) -> AdaptiveConfig {
    AdaptiveConfig {
        mode,
        ..AdaptiveConfig::default()
    }
}

#[test]
fn off_mode_skips_and_proposes_nothing() {
    let store = tmp_store("off");
    seed_mixed_outcomes(&store);

    let report = learner::run(&store, &adaptive(AdaptiveMode::Off), &LearnerOptions::default())
        .expect("run");
    assert_eq!(report.skipped.as_deref(), Some("mode=off"));
    assert!(report.proposals.is_empty());

    let doc = store.load().expect("load");
    assert!(!doc.runtime.adaptive_learning_enabled);
    assert_eq!(doc.domains["travel"].auto_threshold, 0.90);
}

#[test]
fn apply_mode_moves_thresholds_within_contract_ranges() {
    let store = tmp_store("apply");
    seed_mixed_outcomes(&store);

    let report = learner::run(
        &store,
        &adaptive(AdaptiveMode::Apply),
        &LearnerOptions { force: true },
    )
    .expect("run");
    assert_eq!(report.applied, vec!["travel".to_string()]);
    let proposal = &report.proposals["travel"];
    assert_eq!(proposal.sample_count, 14);

    let doc = store.load().expect("load");
    let t = doc.domains["travel"];
    // one max_daily_step up from 0.90
    assert_eq!(t.auto_threshold, 0.92);
    // contract invariants hold after every update
    assert!(t.ask_threshold <= t.auto_threshold - 0.08);
    assert!((0.55..=0.80).contains(&t.ask_threshold));
    assert!((0.80..=0.99).contains(&t.auto_threshold));

    let audit = store.audit_tail(10).expect("audit");
    assert!(audit.iter().any(|l| l.contains("adaptive_thresholds")));
}

#[test]
fn shadow_mode_records_recommendations_without_mutating_gates() {
    let store = tmp_store("shadow");
    seed_mixed_outcomes(&store);

    let report = learner::run(
        &store,
        &adaptive(AdaptiveMode::Shadow),
        &LearnerOptions { force: true },
    )
    .expect("run");
    assert!(report.applied.is_empty());
    assert!(report.proposals.contains_key("travel"));

    let doc = store.load().expect("load");
    assert_eq!(doc.domains["travel"].auto_threshold, 0.90);
    assert!(doc
        .runtime
        .adaptive_learning
        .last_recommendations
        .contains_key("travel"));
}

#[test]
fn thin_samples_are_ignored() {
    let store = tmp_store("thin");
    for n in 0..5 {
        learner::append_event(&store, &event(n, "confirm", 0.7)).expect("append");
    }
    let report = learner::run(
        &store,
        &adaptive(AdaptiveMode::Apply),
        &LearnerOptions { force: true },
    )
    .expect("run");
    assert!(report.proposals.is_empty());
    assert!(report.applied.is_empty());
}

#[test]
fn runs_are_throttled_between_intervals() {
    let store = tmp_store("throttle");
    seed_mixed_outcomes(&store);
    let cfg = adaptive(AdaptiveMode::Shadow);

    let first = learner::run(&store, &cfg, &LearnerOptions { force: true }).expect("run");
    assert!(first.skipped.is_none());

    let second = learner::run(&store, &cfg, &LearnerOptions::default()).expect("run");
    assert_eq!(second.skipped.as_deref(), Some("throttled"));

    // force bypasses the throttle
    let third = learner::run(&store, &cfg, &LearnerOptions { force: true }).expect("run");
    assert!(third.skipped.is_none());
}

#[test]
fn high_confirmation_low_correction_lowers_auto_slowly() {
    let store = tmp_store("lower");
    // 20 confirms, 0 corrections: confirmation_rate 1.0, correction_rate 0.
    for n in 0..20 {
        learner::append_event(&store, &event(n, "confirm", 0.75)).expect("append");
    }
    let report = learner::run(
        &store,
        &adaptive(AdaptiveMode::Apply),
        &LearnerOptions { force: true },
    )
    .expect("run");
    let proposal = &report.proposals["travel"];
    // auto drops by half a step, ask by a full step
    assert_eq!(proposal.auto_threshold, 0.89);
    assert_eq!(proposal.ask_threshold, 0.58);

    let doc = store.load().expect("load");
    let t = doc.domains["travel"];
    assert!(t.ask_threshold <= t.auto_threshold - 0.08);
}
