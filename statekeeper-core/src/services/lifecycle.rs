//! Pending-confirmation lifecycle: applying user decisions and promoting
//! tentatives into the review queue under the pending cap.
//!
//! Resolution never commits the pending observation's original event id: a
//! fresh id is synthesized so the idempotency set cannot swallow the commit.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use schemas::{ConfirmAction, Intent, SchemaName, SchemaSet, SourceRef, StateObservation, UserConfirmation};

use crate::services::dlq;
use crate::services::learner::{self, LearningEvent};
use crate::services::pipeline::{apply_commit, display_value, prompt_from_observation};
use crate::services::resolver;
use crate::services::store::{now_iso, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Committed,
    Rejected,
    NotFound,
    Mismatch,
    ValidationFailed,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Committed => "committed",
            ConfirmationStatus::Rejected => "rejected",
            ConfirmationStatus::NotFound => "not_found",
            ConfirmationStatus::Mismatch => "mismatch",
            ConfirmationStatus::ValidationFailed => "validation_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationOutcome {
    pub status: ConfirmationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ConfirmationOutcome {
    fn status_only(status: ConfirmationStatus, prompt_id: Option<String>) -> Self {
        Self {
            status,
            prompt_id,
            committed_event_id: None,
            dlq_id: None,
            errors: Vec::new(),
        }
    }
}

/// Apply a user decision; schema failures are quarantined.
pub fn apply_confirmation(
    store: &StateStore,
    schemas: &SchemaSet,
    payload: &Value,
) -> Result<ConfirmationOutcome> {
    apply_confirmation_inner(store, schemas, payload, true)
}

/// Same, but without quarantining — the DLQ retry path updates its existing
/// entry instead.
pub fn apply_confirmation_quietly(
    store: &StateStore,
    schemas: &SchemaSet,
    payload: &Value,
) -> Result<ConfirmationOutcome> {
    apply_confirmation_inner(store, schemas, payload, false)
}

fn apply_confirmation_inner(
    store: &StateStore,
    schemas: &SchemaSet,
    payload: &Value,
    quarantine_on_invalid: bool,
) -> Result<ConfirmationOutcome> {
    if let Err(errors) = schemas.validate(SchemaName::Confirmation, payload) {
        let dlq_id = if quarantine_on_invalid {
            Some(dlq::quarantine(store, "confirmation", payload, &errors)?)
        } else {
            None
        };
        let mut outcome =
            ConfirmationOutcome::status_only(ConfirmationStatus::ValidationFailed, None);
        outcome.dlq_id = dlq_id;
        outcome.errors = errors;
        return Ok(outcome);
    }

    let confirmation: UserConfirmation =
        serde_json::from_value(payload.clone()).context("decoding validated confirmation")?;

    let mut doc = store.load()?;
    let Some(prompt) = doc
        .pending_confirmations
        .get(&confirmation.prompt_id)
        .cloned()
    else {
        return Ok(ConfirmationOutcome::status_only(
            ConfirmationStatus::NotFound,
            Some(confirmation.prompt_id),
        ));
    };
    if prompt.entity_id != confirmation.entity_id
        || prompt.domain != confirmation.domain.as_str()
    {
        return Ok(ConfirmationOutcome::status_only(
            ConfirmationStatus::Mismatch,
            Some(confirmation.prompt_id),
        ));
    }

    doc.pending_confirmations.remove(&confirmation.prompt_id);
    doc.learning_stats.ask_user_confirmations += 1;

    if confirmation.action == ConfirmAction::Reject {
        doc.learning_stats.user_rejects += 1;
        store.save(&mut doc)?;
        store.append_audit(&format!(
            "prompt={} | action=reject | no state mutation",
            prompt.prompt_id
        ))?;
        learner::append_event(
            store,
            &learning_event_for(&prompt.observation_event, &prompt, "reject", "corrected"),
        )?;
        return Ok(ConfirmationOutcome::status_only(
            ConfirmationStatus::Rejected,
            Some(prompt.prompt_id),
        ));
    }

    // confirm or edit: synthesize a committed observation with a fresh id.
    // Confirming a retraction keeps the retract intent so the commit still
    // deletes the field; everything else becomes a plain assertion.
    let value = match (&confirmation.action, &confirmation.edited_value) {
        (ConfirmAction::Edit, Some(v)) => v.clone(),
        _ => prompt.observation_event.candidate_value.clone(),
    };
    let intent = if confirmation.action == ConfirmAction::Confirm
        && prompt.observation_event.is_retraction()
    {
        Intent::Retract
    } else {
        Intent::Assertive
    };
    let committed = StateObservation {
        event_id: Uuid::new_v4().to_string(),
        event_ts: confirmation.ts.clone(),
        domain: prompt.observation_event.domain,
        entity_id: prompt.observation_event.entity_id.clone(),
        field: prompt.observation_event.field.clone(),
        candidate_value: value,
        intent,
        source: SourceRef::new("user_confirmation", format!("prompt:{}", prompt.prompt_id)),
        corroborators: Vec::new(),
    };
    let committed_payload =
        serde_json::to_value(&committed).context("encoding synthesized observation")?;
    if let Err(errors) = schemas.validate(SchemaName::Observation, &committed_payload) {
        store.save(&mut doc)?;
        let dlq_id = if quarantine_on_invalid {
            Some(dlq::quarantine(store, "observation", &committed_payload, &errors)?)
        } else {
            None
        };
        let mut outcome = ConfirmationOutcome::status_only(
            ConfirmationStatus::ValidationFailed,
            Some(prompt.prompt_id),
        );
        outcome.dlq_id = dlq_id;
        outcome.errors = errors;
        return Ok(outcome);
    }

    let (confidence, _) = resolver::score(&doc, &committed, Utc::now());
    doc.note_processed(&committed.event_id);
    apply_commit(&mut doc, &committed, confidence);

    let (action_str, outcome_str) = if confirmation.action == ConfirmAction::Edit {
        doc.learning_stats.user_edits += 1;
        ("edit", "corrected")
    } else {
        doc.learning_stats.user_confirms += 1;
        ("confirm", "accepted")
    };
    store.save(&mut doc)?;
    store.append_audit(&format!(
        "{} | decision=user_{} | prompt={} | {}/{}.{} | value={} | confidence={:.3} | source=user_confirmation",
        committed.event_id,
        action_str,
        prompt.prompt_id,
        committed.entity_id,
        committed.domain,
        committed.stored_field(),
        display_value(&committed.candidate_value),
        confidence
    ))?;
    learner::append_event(
        store,
        &learning_event_for(&prompt.observation_event, &prompt, action_str, outcome_str),
    )?;

    let mut outcome =
        ConfirmationOutcome::status_only(ConfirmationStatus::Committed, Some(prompt.prompt_id));
    outcome.committed_event_id = Some(committed.event_id);
    Ok(outcome)
}

fn learning_event_for(
    observed: &StateObservation,
    prompt: &crate::services::store::PendingPrompt,
    action: &str,
    outcome: &str,
) -> LearningEvent {
    LearningEvent {
        learning_event_id: Uuid::new_v4().to_string(),
        ts: now_iso(),
        entity_id: prompt.entity_id.clone(),
        domain: prompt.domain.clone(),
        field: observed.field.clone(),
        decision: "ask_user".to_string(),
        action: action.to_string(),
        outcome: outcome.to_string(),
        confidence: prompt.confidence,
        intent: observed.intent.as_str().to_string(),
        source_type: observed.source.kind.clone(),
        source_ref: observed.source.reference.clone(),
        prompt_id: prompt.prompt_id.clone(),
    }
}

// -------------------------------------------------------------------------
// Review-queue promotion
// -------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PromoteOptions {
    pub entity_id: Option<String>,
    pub domain: Option<String>,
    pub min_confidence: f64,
    pub limit: usize,
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoteOutcome {
    pub promoted_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompt_ids: Vec<String>,
}

/// Promote eligible tentatives into pending prompts, never exceeding
/// `max_pending` for the filtered scope. The cap is compared against the
/// filtered pending count; pass no filter for a global cap.
pub fn promote_review_queue(store: &StateStore, opts: &PromoteOptions) -> Result<PromoteOutcome> {
    let mut doc = store.load()?;

    let matches_filter = |entity_id: &str, domain: &str| {
        opts.entity_id
            .as_deref()
            .map(|e| e == entity_id)
            .unwrap_or(true)
            && opts.domain.as_deref().map(|d| d == domain).unwrap_or(true)
    };

    let current_pending = doc
        .pending_confirmations
        .values()
        .filter(|p| matches_filter(&p.entity_id, &p.domain))
        .count();
    let remaining = opts.max_pending.saturating_sub(current_pending);
    if remaining == 0 {
        return Ok(PromoteOutcome {
            promoted_count: 0,
            reason: Some("pending_limit_reached".to_string()),
            prompt_ids: Vec::new(),
        });
    }

    let referenced: HashSet<String> = doc
        .pending_confirmations
        .values()
        .map(|p| p.observation_event.event_id.clone())
        .collect();

    let mut candidates: Vec<(usize, f64, String)> = doc
        .tentative_observations
        .iter()
        .enumerate()
        .filter(|(_, t)| t.promoted_at.is_none())
        .filter(|(_, t)| {
            matches_filter(&t.observation.entity_id, t.observation.domain.as_str())
        })
        .filter(|(_, t)| t.confidence >= opts.min_confidence)
        .filter(|(_, t)| !referenced.contains(&t.observation.event_id))
        .map(|(i, t)| (i, t.confidence, t.observed_at.clone()))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
    });

    let now = now_iso();
    let mut prompts = Vec::new();
    for (index, _, _) in candidates.into_iter().take(opts.limit.min(remaining)) {
        let tentative = &mut doc.tentative_observations[index];
        let prompt = prompt_from_observation(
            &tentative.observation,
            tentative.confidence,
            &tentative.reasons,
        );
        tentative.promoted_at = Some(now.clone());
        tentative.prompt_id = Some(prompt.prompt_id.clone());
        prompts.push(prompt);
    }

    if prompts.is_empty() {
        return Ok(PromoteOutcome {
            promoted_count: 0,
            reason: Some("no_eligible_tentatives".to_string()),
            prompt_ids: Vec::new(),
        });
    }

    let prompt_ids: Vec<String> = prompts.iter().map(|p| p.prompt_id.clone()).collect();
    for prompt in prompts {
        doc.pending_confirmations
            .insert(prompt.prompt_id.clone(), prompt);
    }
    doc.learning_stats.ask_user_prompts += prompt_ids.len() as u64;
    doc.runtime.last_review_queue_at = Some(now);
    store.save(&mut doc)?;
    store.append_audit(&format!(
        "review_queue | promoted={} | prompts={}",
        prompt_ids.len(),
        prompt_ids.join(",")
    ))?;

    Ok(PromoteOutcome {
        promoted_count: prompt_ids.len(),
        reason: None,
        prompt_ids,
    })
}
