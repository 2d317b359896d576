//! Ingestion pipeline: validate, dedupe, resolve, apply, audit.
//!
//! Idempotency hinges on `processed_event_ids` being written in the same
//! save as the decision's effect: a replayed event id returns `duplicate`
//! before any second mutation can happen.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use schemas::{SchemaName, SchemaSet, StateObservation};

use crate::services::dlq;
use crate::services::resolver::{self, Outcome};
use crate::services::store::{
    now_iso, Document, PendingPrompt, StateRecord, StateStore, TentativeObservation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Committed,
    PendingConfirmation,
    Tentative,
    Duplicate,
    ValidationFailed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Committed => "committed",
            IngestStatus::PendingConfirmation => "pending_confirmation",
            IngestStatus::Tentative => "tentative",
            IngestStatus::Duplicate => "duplicate",
            IngestStatus::ValidationFailed => "validation_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl IngestOutcome {
    fn bare(status: IngestStatus, event_id: Option<String>) -> Self {
        Self {
            status,
            event_id,
            confidence: None,
            margin: None,
            reasons: Vec::new(),
            prompt_id: None,
            dlq_id: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub force_commit: bool,
    /// The DLQ retry path disables this so a re-failing payload updates its
    /// existing entry instead of spawning a fresh one.
    pub quarantine_on_invalid: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            force_commit: false,
            quarantine_on_invalid: true,
        }
    }
}

/// Render a candidate value for audit lines and prompt text: strings as-is,
/// everything else JSON-encoded.
pub fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write or delete the record for an observation. Shared with the
/// confirmation lifecycle, which commits without re-running the gate.
pub(crate) fn apply_commit(doc: &mut Document, obs: &StateObservation, confidence: f64) {
    let domain = obs.domain.as_str();
    let field = obs.stored_field().to_string();
    if obs.is_retraction() {
        doc.remove_record(&obs.entity_id, domain, &field);
    } else {
        doc.set_record(
            &obs.entity_id,
            domain,
            &field,
            StateRecord {
                value: obs.candidate_value.clone(),
                last_update: now_iso(),
                source: obs.source.kind.clone(),
                confidence,
                event_id: obs.event_id.clone(),
            },
        );
    }
}

pub(crate) fn prompt_from_observation(
    obs: &StateObservation,
    confidence: f64,
    reasons: &[String],
) -> PendingPrompt {
    PendingPrompt {
        prompt_id: Uuid::new_v4().to_string(),
        entity_id: obs.entity_id.clone(),
        domain: obs.domain.as_str().to_string(),
        proposed_change: format!("{} -> {}", obs.field, display_value(&obs.candidate_value)),
        confidence,
        reason_summary: reasons.iter().take(5).cloned().collect(),
        action: "confirm".to_string(),
        observation_event: obs.clone(),
        source: obs.source.kind.clone(),
        created_at: now_iso(),
    }
}

/// Drive one observation through validation, dedupe, resolution, and the
/// chosen mutation. Every path that mutates saves exactly once, then audits.
pub fn ingest(
    store: &StateStore,
    schemas: &SchemaSet,
    payload: &Value,
    opts: &IngestOptions,
) -> Result<IngestOutcome> {
    if let Err(errors) = schemas.validate(SchemaName::Observation, payload) {
        let dlq_id = if opts.quarantine_on_invalid {
            Some(dlq::quarantine(store, "observation", payload, &errors)?)
        } else {
            None
        };
        let mut outcome = IngestOutcome::bare(IngestStatus::ValidationFailed, None);
        outcome.dlq_id = dlq_id;
        outcome.errors = errors;
        return Ok(outcome);
    }

    let obs: StateObservation =
        serde_json::from_value(payload.clone()).context("decoding validated observation")?;

    let mut doc = store.load()?;
    if doc.is_processed(&obs.event_id) {
        return Ok(IngestOutcome::bare(
            IngestStatus::Duplicate,
            Some(obs.event_id),
        ));
    }
    doc.note_processed(&obs.event_id);

    let resolution = resolver::resolve(&doc, &obs, Utc::now(), opts.force_commit);
    let entity = &obs.entity_id;
    let domain = obs.domain.as_str();
    let field = obs.stored_field().to_string();

    let mut outcome = IngestOutcome::bare(IngestStatus::Committed, Some(obs.event_id.clone()));
    outcome.confidence = Some(resolution.confidence);
    outcome.margin = Some(resolution.margin);
    outcome.reasons = resolution.reasons.clone();

    match resolution.outcome {
        Outcome::AutoCommit => {
            apply_commit(&mut doc, &obs, resolution.confidence);
            doc.learning_stats.auto_commits += 1;
            store.save(&mut doc)?;
            store.append_audit(&format!(
                "{} | decision=auto_commit | {}/{}.{} | value={} | confidence={:.3} | source={}",
                obs.event_id,
                entity,
                domain,
                field,
                display_value(&obs.candidate_value),
                resolution.confidence,
                obs.source.kind
            ))?;
            outcome.status = IngestStatus::Committed;
        }
        Outcome::AskUser => {
            let prompt = prompt_from_observation(&obs, resolution.confidence, &resolution.reasons);
            let prompt_id = prompt.prompt_id.clone();
            doc.pending_confirmations
                .insert(prompt_id.clone(), prompt);
            doc.learning_stats.ask_user_prompts += 1;
            store.save(&mut doc)?;
            store.append_audit(&format!(
                "{} | decision=ask_user | prompt_id={} | {}/{}.{} | confidence={:.3} | source={}",
                obs.event_id, prompt_id, entity, domain, field, resolution.confidence, obs.source.kind
            ))?;
            outcome.status = IngestStatus::PendingConfirmation;
            outcome.prompt_id = Some(prompt_id);
        }
        Outcome::TentativeReject => {
            doc.push_tentative(TentativeObservation {
                observation: obs.clone(),
                observed_at: now_iso(),
                confidence: resolution.confidence,
                reasons: resolution.reasons.clone(),
                promoted_at: None,
                prompt_id: None,
            });
            doc.learning_stats.tentative_rejects += 1;
            store.save(&mut doc)?;
            store.append_audit(&format!(
                "{} | decision=tentative_reject | {}/{}.{} | confidence={:.3} | source={}",
                obs.event_id, entity, domain, field, resolution.confidence, obs.source.kind
            ))?;
            outcome.status = IngestStatus::Tentative;
        }
    }

    Ok(outcome)
}
