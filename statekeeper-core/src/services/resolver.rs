//! Confidence scoring and the auto/ask/tentative decision.
//!
//! Pure over `(document, observation, now)`: no I/O, no clock reads. The
//! factor tables live in config (`source_reliability` is carried in the
//! document so the learner can see it evolve).

use chrono::{DateTime, Utc};

use schemas::StateObservation;

use crate::config::{intent_factor, DomainThresholds, UNKNOWN_SOURCE_RELIABILITY};
use crate::services::store::Document;

/// Hours after which recency bottoms out at its floor.
const RECENCY_HORIZON_HOURS: f64 = 168.0;
const RECENCY_FLOOR: f64 = 0.4;
const CORROBORATION_STEP: f64 = 0.05;
const CORROBORATION_CAP: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    AutoCommit,
    AskUser,
    TentativeReject,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::AutoCommit => "auto_commit",
            Outcome::AskUser => "ask_user",
            Outcome::TentativeReject => "tentative_reject",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    pub confidence: f64,
    pub current_confidence: f64,
    pub margin: f64,
    pub reasons: Vec<String>,
}

pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn recency_factor(event_ts: &str, now: DateTime<Utc>) -> f64 {
    let age_h = DateTime::parse_from_rfc3339(event_ts)
        .map(|ts| {
            let secs = (now - ts.with_timezone(&Utc)).num_seconds();
            (secs.max(0) as f64) / 3600.0
        })
        .unwrap_or(0.0);
    let decayed = 1.0 - age_h.min(RECENCY_HORIZON_HOURS) / RECENCY_HORIZON_HOURS * 0.6;
    decayed.clamp(RECENCY_FLOOR, 1.0)
}

fn corroboration_factor(n: usize) -> f64 {
    (1.0 + CORROBORATION_STEP * n as f64).clamp(1.0, CORROBORATION_CAP)
}

/// Confidence of a single observation plus the factor breakdown as reasons.
pub fn score(doc: &Document, obs: &StateObservation, now: DateTime<Utc>) -> (f64, Vec<String>) {
    let reliability = doc
        .source_reliability
        .get(&obs.source.kind)
        .copied()
        .unwrap_or(UNKNOWN_SOURCE_RELIABILITY);
    let intent = intent_factor(obs.intent);
    let recency = recency_factor(&obs.event_ts, now);
    let corroboration = corroboration_factor(obs.corroborators.len());

    let confidence = round3(clamp01(reliability * intent * recency * corroboration));
    let reasons = vec![
        format!("source_reliability({})={:.2}", obs.source.kind, reliability),
        format!("intent_factor({})={:.2}", obs.intent, intent),
        format!("recency_factor={:.3}", recency),
        format!(
            "corroboration_factor={:.2} (n={})",
            corroboration,
            obs.corroborators.len()
        ),
    ];
    (confidence, reasons)
}

/// Route an observation: auto-commit, ask the user, or stash tentatively.
pub fn resolve(
    doc: &Document,
    obs: &StateObservation,
    now: DateTime<Utc>,
    force_commit: bool,
) -> Resolution {
    if force_commit {
        let (confidence, _) = score(doc, obs, now);
        let current = current_confidence(doc, obs);
        return Resolution {
            outcome: Outcome::AutoCommit,
            confidence,
            current_confidence: current,
            margin: round3(confidence - current),
            reasons: vec!["force_commit=true".to_string()],
        };
    }

    let (confidence, mut reasons) = score(doc, obs, now);
    let current = current_confidence(doc, obs);
    let margin = round3(confidence - current);
    let thresholds = thresholds_for(doc, obs);

    // Equal confidence is a tie; a tie never displaces the committed record.
    let outcome = if confidence >= thresholds.auto_threshold
        && margin >= thresholds.margin_threshold
        && margin > 0.0
    {
        reasons.push(format!(
            "confidence {:.3} >= auto {:.3}, margin {:.3} >= {:.3}",
            confidence, thresholds.auto_threshold, margin, thresholds.margin_threshold
        ));
        Outcome::AutoCommit
    } else if confidence >= thresholds.ask_threshold {
        reasons.push(format!(
            "confidence {:.3} in ask band [{:.3}, auto)",
            confidence, thresholds.ask_threshold
        ));
        Outcome::AskUser
    } else {
        reasons.push(format!(
            "confidence {:.3} below ask {:.3}",
            confidence, thresholds.ask_threshold
        ));
        Outcome::TentativeReject
    };

    Resolution {
        outcome,
        confidence,
        current_confidence: current,
        margin,
        reasons,
    }
}

fn thresholds_for(doc: &Document, obs: &StateObservation) -> DomainThresholds {
    doc.domains
        .get(obs.domain.as_str())
        .copied()
        .unwrap_or_default()
}

fn current_confidence(doc: &Document, obs: &StateObservation) -> f64 {
    doc.record(&obs.entity_id, obs.domain.as_str(), obs.stored_field())
        .map(|r| r.confidence)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::services::store::StateRecord;

    fn obs(source_type: &str, intent: &str, ts: &str, corroborators: usize) -> StateObservation {
        let corr: Vec<_> = (0..corroborators)
            .map(|i| json!({ "type": "witness", "ref": format!("w:{i}") }))
            .collect();
        serde_json::from_value(json!({
            "event_id": "cf98a1b2-0000-4000-8000-000000000001",
            "event_ts": ts,
            "domain": "travel",
            "entity_id": "user:primary",
            "field": "travel.location",
            "candidate_value": "Tahoe",
            "intent": intent,
            "source": { "type": source_type, "ref": "thread:1" },
            "corroborators": corr
        }))
        .expect("obs")
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-20T10:00:00Z")
            .expect("now")
            .with_timezone(&Utc)
    }

    #[test]
    fn fresh_assertive_conversation_auto_commits() {
        let doc = Document::default();
        let r = resolve(&doc, &obs("conversation_assertive", "assertive", "2026-02-20T10:00:00Z", 0), now(), false);
        assert_eq!(r.outcome, Outcome::AutoCommit);
        assert_eq!(r.confidence, 0.92);
        assert_eq!(r.margin, 0.92);
    }

    #[test]
    fn static_markdown_with_corroboration_lands_in_ask_band() {
        let doc = Document::default();
        let r = resolve(&doc, &obs("static_markdown", "assertive", "2026-02-20T10:00:00Z", 2), now(), false);
        assert_eq!(r.outcome, Outcome::AskUser);
        assert_eq!(r.confidence, 0.66);
    }

    #[test]
    fn hypothetical_planning_source_is_tentative() {
        let doc = Document::default();
        let r = resolve(&doc, &obs("conversation_planning", "hypothetical", "2026-02-20T10:00:00Z", 0), now(), false);
        assert_eq!(r.outcome, Outcome::TentativeReject);
        assert!(r.confidence < 0.60);
    }

    #[test]
    fn unknown_source_defaults_to_half() {
        let doc = Document::default();
        let mut o = obs("conversation_assertive", "assertive", "2026-02-20T10:00:00Z", 0);
        o.source.kind = "mystery_feed".to_string();
        let (confidence, reasons) = score(&doc, &o, now());
        assert_eq!(confidence, 0.5);
        assert!(reasons[0].contains("0.50"));
    }

    #[test]
    fn recency_is_one_at_now_and_floored_beyond_the_horizon() {
        assert_eq!(recency_factor("2026-02-20T10:00:00Z", now()), 1.0);
        // 200h old, beyond the 168h horizon
        assert_eq!(recency_factor("2026-02-12T02:00:00Z", now()), RECENCY_FLOOR);
        // halfway: 84h -> 1 - 0.5*0.6 = 0.7
        let halfway = recency_factor("2026-02-16T22:00:00Z", now());
        assert!((halfway - 0.7).abs() < 1e-9);
    }

    #[test]
    fn corroboration_caps_at_four_witnesses() {
        assert_eq!(corroboration_factor(0), 1.0);
        assert_eq!(corroboration_factor(4), CORROBORATION_CAP);
        assert_eq!(corroboration_factor(10), CORROBORATION_CAP);
    }

    #[test]
    fn equal_confidence_never_displaces_the_record() {
        let mut doc = Document::default();
        doc.set_record(
            "user:primary",
            "travel",
            "location",
            StateRecord {
                value: json!("Tahoe"),
                last_update: "2026-02-19T10:00:00+00:00".into(),
                source: "conversation_assertive".into(),
                confidence: 0.92,
                event_id: "00000000-0000-4000-8000-00000000aaaa".into(),
            },
        );
        // Zero out the margin requirement; a tie must still not auto-commit.
        if let Some(t) = doc.domains.get_mut("travel") {
            t.margin_threshold = 0.0;
        }
        let r = resolve(&doc, &obs("conversation_assertive", "assertive", "2026-02-20T10:00:00Z", 0), now(), false);
        assert_eq!(r.margin, 0.0);
        assert_eq!(r.outcome, Outcome::AskUser);
    }

    #[test]
    fn force_commit_short_circuits() {
        let doc = Document::default();
        let r = resolve(&doc, &obs("static_markdown", "hypothetical", "2026-02-20T10:00:00Z", 0), now(), true);
        assert_eq!(r.outcome, Outcome::AutoCommit);
        assert_eq!(r.reasons, vec!["force_commit=true".to_string()]);
    }
}
