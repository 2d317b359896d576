//! Signal adapter: batched calendar/email input to observation batches.
//!
//! Identity is the whole point here. Every item's `event_id` is uuid5 over
//! `(kind, mode, entity_id, item.ref, canonical value)`, so a re-poll of the
//! same upstream state replays into `duplicate`s, while a content change
//! produces a fresh event that re-enters resolution against the prior record.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};

use schemas::{
    canonical_json, deterministic_event_id, Intent, SchemaName, SchemaSet, SignalEvent,
    SignalItem, SignalSource, SourceKind, SourceMode, SourceRef, StateObservation,
};

use crate::services::dlq;
use crate::services::extract::infer_domain;
use crate::services::intent::rule_classify;
use crate::services::pipeline::{self, IngestOptions, IngestStatus};
use crate::services::store::{now_iso, StateStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalSummary {
    pub status: String,
    pub committed: usize,
    pub pending: usize,
    pub tentative: usize,
    pub duplicates: usize,
    pub validation_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

fn source_type_for(kind: SourceKind, mode: SourceMode) -> &'static str {
    match (kind, mode) {
        (SourceKind::Calendar, SourceMode::Poll) => "calendar_poll",
        (SourceKind::Calendar, SourceMode::Webhook) => "calendar_webhook",
        (SourceKind::Email, SourceMode::Poll) => "email_poll",
        (SourceKind::Email, SourceMode::Webhook) => "email_webhook",
    }
}

/// Explode a signal batch into observations and ingest each in array order.
pub fn ingest_signal(
    store: &StateStore,
    schemas: &SchemaSet,
    payload: &Value,
    opts: &IngestOptions,
) -> Result<SignalSummary> {
    if let Err(errors) = schemas.validate(SchemaName::Signal, payload) {
        let dlq_id = if opts.quarantine_on_invalid {
            Some(dlq::quarantine(store, "signal", payload, &errors)?)
        } else {
            None
        };
        return Ok(SignalSummary {
            status: "validation_failed".to_string(),
            dlq_id,
            errors,
            ..SignalSummary::default()
        });
    }

    let signal: SignalEvent =
        serde_json::from_value(payload.clone()).context("decoding validated signal")?;
    let source_type = source_type_for(signal.source.kind, signal.source.mode);

    let mut summary = SignalSummary {
        status: "ok".to_string(),
        ..SignalSummary::default()
    };

    for (index, item) in signal.items.iter().enumerate() {
        let identity = format!(
            "{}:{}:{}:{}:{}",
            signal.source.kind.as_str(),
            signal.source.mode.as_str(),
            signal.entity_id,
            item.reference,
            canonical_json(&item.value)
        );
        let obs = StateObservation {
            event_id: deterministic_event_id(&identity),
            event_ts: signal.event_ts.clone(),
            domain: item.domain,
            entity_id: signal.entity_id.clone(),
            field: item.field.clone(),
            candidate_value: item.value.clone(),
            intent: item.intent,
            source: SourceRef::new(
                source_type,
                format!("{}#item-{}", signal.source.reference, index + 1),
            ),
            corroborators: item.corroborators.clone(),
        };
        let obs_payload = serde_json::to_value(&obs).context("encoding signal observation")?;
        let outcome = pipeline::ingest(store, schemas, &obs_payload, opts)?;
        match outcome.status {
            IngestStatus::Committed => summary.committed += 1,
            IngestStatus::PendingConfirmation => summary.pending += 1,
            IngestStatus::Tentative => summary.tentative += 1,
            IngestStatus::Duplicate => summary.duplicates += 1,
            IngestStatus::ValidationFailed => summary.validation_failed += 1,
        }
    }

    let mut doc = store.load()?;
    doc.runtime.last_poll_at = Some(now_iso());
    store.save(&mut doc)?;

    Ok(summary)
}

// -------------------------------------------------------------------------
// Builders from raw fetcher output (arrays of event/thread objects)
// -------------------------------------------------------------------------

fn text_of(v: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn raw_id(v: &Value) -> &str {
    v.get("id").and_then(Value::as_str).unwrap_or("unknown")
}

fn build_signal(
    kind: SourceKind,
    entity_id: &str,
    reference: &str,
    items: Vec<SignalItem>,
) -> SignalEvent {
    let signal_id = deterministic_event_id(&format!(
        "signal:{}:{}:{}",
        kind.as_str(),
        reference,
        items.len()
    ));
    SignalEvent {
        signal_id,
        event_ts: now_iso(),
        source: SignalSource {
            kind,
            mode: SourceMode::Poll,
            reference: reference.to_string(),
        },
        entity_id: entity_id.to_string(),
        items,
    }
}

/// Map raw calendar events (fetcher stdout) into a poll signal. Domain comes
/// from the event's own text; the value keeps only the fields the engine can
/// compare deterministically.
pub fn signal_from_calendar_events(
    entity_id: &str,
    reference: &str,
    events: &[Value],
) -> SignalEvent {
    let items = events
        .iter()
        .map(|event| {
            let text = text_of(event, &["summary", "description", "location"]);
            let domain = infer_domain(&text);
            SignalItem {
                domain,
                field: format!("{domain}.upcoming_event"),
                reference: format!("calendar_event:{}", raw_id(event)),
                value: json!({
                    "summary": event.get("summary").cloned().unwrap_or(Value::Null),
                    "start": event.get("start").cloned().unwrap_or(Value::Null),
                    "end": event.get("end").cloned().unwrap_or(Value::Null),
                    "location": event.get("location").cloned().unwrap_or(Value::Null),
                }),
                intent: Intent::Planning,
                corroborators: Vec::new(),
            }
        })
        .collect();
    build_signal(SourceKind::Calendar, entity_id, reference, items)
}

/// Map raw mail threads into a poll signal. Intent comes from the rule
/// classifier over subject + snippet.
pub fn signal_from_email_threads(
    entity_id: &str,
    reference: &str,
    threads: &[Value],
) -> SignalEvent {
    let items = threads
        .iter()
        .map(|thread| {
            let text = text_of(thread, &["subject", "from", "labels", "snippet"]);
            let domain = infer_domain(&text);
            SignalItem {
                domain,
                field: format!("{domain}.email_thread"),
                reference: format!("email_thread:{}", raw_id(thread)),
                value: json!({
                    "subject": thread.get("subject").cloned().unwrap_or(Value::Null),
                    "from": thread.get("from").cloned().unwrap_or(Value::Null),
                    "snippet": thread.get("snippet").cloned().unwrap_or(Value::Null),
                }),
                intent: rule_classify(&text_of(thread, &["subject", "snippet"])),
                corroborators: Vec::new(),
            }
        })
        .collect();
    build_signal(SourceKind::Email, entity_id, reference, items)
}
