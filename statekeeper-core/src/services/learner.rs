//! Adaptive threshold learner over recorded ask-user outcomes.
//!
//! Modes: off (default), shadow (recommend only), apply (mutate per-domain
//! thresholds). Every adjustment is bounded by `max_daily_step` per run and
//! clamped to the contract ranges, so a bad week of data cannot walk the
//! gates somewhere unsafe.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{AdaptiveConfig, AdaptiveMode, DomainThresholds};
use crate::services::resolver::round3;
use crate::services::store::StateStore;
use crate::utils::fsio::{append_line, read_opt};

pub const AUTO_RANGE: (f64, f64) = (0.80, 0.99);
pub const ASK_RANGE: (f64, f64) = (0.55, 0.80);
pub const ASK_AUTO_GAP: f64 = 0.08;

/// One ask-user outcome, appended by the confirmation lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub learning_event_id: String,
    pub ts: String,
    pub entity_id: String,
    pub domain: String,
    pub field: String,
    pub decision: String,
    pub action: String,
    pub outcome: String,
    pub confidence: f64,
    pub intent: String,
    pub source_type: String,
    pub source_ref: String,
    pub prompt_id: String,
}

pub fn append_event(store: &StateStore, event: &LearningEvent) -> Result<()> {
    let line = serde_json::to_string(event).context("serializing learning event")?;
    append_line(&store.learning_events_path(), &line)
}

/// Read all events; malformed lines are counted, not fatal.
pub fn read_events(store: &StateStore) -> Result<(Vec<LearningEvent>, usize)> {
    let mut events = Vec::new();
    let mut malformed = 0usize;
    if let Some(text) = read_opt(&store.learning_events_path())? {
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LearningEvent>(line) {
                Ok(e) => events.push(e),
                Err(_) => malformed += 1,
            }
        }
    }
    Ok((events, malformed))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LearnerOptions {
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdProposal {
    pub ask_threshold: f64,
    pub auto_threshold: f64,
    pub sample_count: usize,
    pub confirmation_rate: f64,
    pub correction_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerReport {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub proposals: BTreeMap<String, ThresholdProposal>,
    pub applied: Vec<String>,
}

/// Nearest-rank percentile over an unsorted sample.
fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn step_toward(current: f64, candidate: f64, max_step: f64) -> f64 {
    let delta = (candidate - current).clamp(-max_step, max_step);
    round3(current + delta)
}

/// One learner run. Throttled to `min_interval_hours` unless forced.
pub fn run(store: &StateStore, cfg: &AdaptiveConfig, opts: &LearnerOptions) -> Result<LearnerReport> {
    let mut doc = store.load()?;
    let mode = cfg.mode;
    doc.runtime.adaptive_learning.mode = mode.as_str().to_string();
    doc.runtime.adaptive_learning_enabled = mode != AdaptiveMode::Off;

    let mut report = LearnerReport {
        mode: mode.as_str().to_string(),
        skipped: None,
        proposals: BTreeMap::new(),
        applied: Vec::new(),
    };

    if mode == AdaptiveMode::Off {
        report.skipped = Some("mode=off".to_string());
        store.save(&mut doc)?;
        return Ok(report);
    }

    let now = Utc::now();
    if !opts.force {
        if let Some(last) = doc
            .runtime
            .adaptive_learning
            .last_run_at
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        {
            if now - last.with_timezone(&Utc) < Duration::hours(cfg.min_interval_hours) {
                report.skipped = Some("throttled".to_string());
                store.save(&mut doc)?;
                return Ok(report);
            }
        }
    }

    let cutoff = now - Duration::days(cfg.lookback_days);
    let (events, _malformed) = read_events(store)?;
    let mut by_domain: BTreeMap<String, Vec<&LearningEvent>> = BTreeMap::new();
    for event in &events {
        if event.decision != "ask_user" {
            continue;
        }
        if !matches!(event.action.as_str(), "confirm" | "reject" | "edit") {
            continue;
        }
        let Some(ts) = DateTime::parse_from_rfc3339(&event.ts).ok() else {
            continue;
        };
        if ts.with_timezone(&Utc) < cutoff {
            continue;
        }
        by_domain.entry(event.domain.clone()).or_default().push(event);
    }

    for (domain, sample) in by_domain {
        if sample.len() < cfg.min_samples {
            continue;
        }
        let samples = sample.len() as f64;
        let confirms = sample.iter().filter(|e| e.action == "confirm").count() as f64;
        let corrections = sample
            .iter()
            .filter(|e| matches!(e.action.as_str(), "reject" | "edit"))
            .count() as f64;
        let confirmation_rate = confirms / samples;
        let correction_rate = corrections / samples;

        let current = doc.domains.get(&domain).copied().unwrap_or_default();

        let mut candidate_auto = current.auto_threshold;
        if correction_rate > cfg.target_correction_rate {
            candidate_auto += cfg.max_daily_step;
        } else if correction_rate < cfg.target_correction_rate / 2.0
            && confirmation_rate >= cfg.high_confirmation_rate
        {
            candidate_auto -= cfg.max_daily_step * 0.5;
        }
        let correction_confidences: Vec<f64> = sample
            .iter()
            .filter(|e| matches!(e.action.as_str(), "reject" | "edit"))
            .map(|e| e.confidence)
            .collect();
        if correction_confidences.len() >= 3 {
            let floor = percentile(&correction_confidences, 0.75) + 0.01;
            candidate_auto = candidate_auto.max(floor);
        }
        candidate_auto = candidate_auto.clamp(AUTO_RANGE.0, AUTO_RANGE.1);

        let mut candidate_ask = current.ask_threshold;
        if confirmation_rate < cfg.low_confirmation_rate {
            candidate_ask += cfg.max_daily_step;
        } else if confirmation_rate > cfg.high_confirmation_rate {
            candidate_ask -= cfg.max_daily_step;
        }
        candidate_ask = candidate_ask
            .min(candidate_auto - ASK_AUTO_GAP)
            .clamp(ASK_RANGE.0, ASK_RANGE.1);

        let new_auto = step_toward(current.auto_threshold, candidate_auto, cfg.max_daily_step)
            .clamp(AUTO_RANGE.0, AUTO_RANGE.1);
        let new_ask = step_toward(current.ask_threshold, candidate_ask, cfg.max_daily_step)
            .min(round3(new_auto - ASK_AUTO_GAP))
            .clamp(ASK_RANGE.0, ASK_RANGE.1);

        report.proposals.insert(
            domain.clone(),
            ThresholdProposal {
                ask_threshold: new_ask,
                auto_threshold: new_auto,
                sample_count: sample.len(),
                confirmation_rate: round3(confirmation_rate),
                correction_rate: round3(correction_rate),
            },
        );

        match mode {
            AdaptiveMode::Apply => {
                let changed = round3(current.ask_threshold) != new_ask
                    || round3(current.auto_threshold) != new_auto;
                if changed {
                    doc.domains.insert(
                        domain.clone(),
                        DomainThresholds {
                            ask_threshold: new_ask,
                            auto_threshold: new_auto,
                            margin_threshold: current.margin_threshold,
                        },
                    );
                    report.applied.push(domain.clone());
                }
            }
            AdaptiveMode::Shadow => {
                doc.runtime.adaptive_learning.last_recommendations.insert(
                    domain.clone(),
                    DomainThresholds {
                        ask_threshold: new_ask,
                        auto_threshold: new_auto,
                        margin_threshold: current.margin_threshold,
                    },
                );
            }
            AdaptiveMode::Off => {}
        }
    }

    doc.runtime.adaptive_learning.last_run_at = Some(now.to_rfc3339());
    store.save(&mut doc)?;
    for domain in &report.applied {
        if let Some(t) = doc.domains.get(domain) {
            store.append_audit(&format!(
                "adaptive_thresholds | domain={} | ask={:.3} auto={:.3}",
                domain, t.ask_threshold, t.auto_threshold
            ))?;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_nearest_rank() {
        let vals = [0.7, 0.9, 0.8];
        // rank ceil(0.75*3)=3 -> third smallest
        assert_eq!(percentile(&vals, 0.75), 0.9);
        assert_eq!(percentile(&[0.5], 0.75), 0.5);
    }

    #[test]
    fn step_is_bounded() {
        assert_eq!(step_toward(0.90, 0.99, 0.02), 0.92);
        assert_eq!(step_toward(0.90, 0.85, 0.02), 0.88);
        assert_eq!(step_toward(0.90, 0.905, 0.02), 0.905);
    }
}
