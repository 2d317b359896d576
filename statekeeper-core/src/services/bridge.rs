//! Runtime bridge: the two host-chat hooks and the control command.
//!
//! Hook A injects a snapshot of committed state ahead of model generation.
//! Hook B turns qualifying inbound messages into observations (or resolves
//! the active prompt when the message reads as a yes/no answer). The
//! `/state-confirm` handler is the manual surface over the same lifecycle.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};

use schemas::{deterministic_event_id, SchemaSet};

use crate::config::EngineConfig;
use crate::services::extract::{infer_domain, observation_from_text};
use crate::services::intent::IntentClassifier;
use crate::services::lifecycle::{self, ConfirmationStatus};
use crate::services::pipeline::{self, display_value, IngestOptions, IngestStatus};
use crate::services::projection;
use crate::services::store::{PendingPrompt, StateStore};
use crate::services::worker::{
    self, dispatch_buttons, dispatch_text, load_worker_state, parse_reply, resolve_prompt_ref,
    save_worker_state, Button, Decision, RefMatch, EDIT_USAGE_HINT,
};

const SNAPSHOT_HEADER: &str = "Canonical state snapshot:";
const SNAPSHOT_FOOTER: &str =
    "If chat context conflicts with this snapshot, prefer this snapshot.";
const VALUE_SUMMARY_CHARS: usize = 80;

fn summarize(value: &Value) -> String {
    let text = display_value(value);
    if text.chars().count() > VALUE_SUMMARY_CHARS {
        let mut out: String = text.chars().take(VALUE_SUMMARY_CHARS).collect();
        out.push('…');
        out
    } else {
        text
    }
}

/// Hook A: the pre-response context block, or `None` when there is nothing
/// worth injecting.
pub fn prepend_context(store: &StateStore, config: &EngineConfig) -> Result<Option<String>> {
    let doc = store.load()?;
    let pending = doc.pending_sorted();
    if doc.committed_record_count() == 0 && pending.is_empty() {
        return Ok(None);
    }

    let mut lines = vec![SNAPSHOT_HEADER.to_string()];
    let cap = config.ingest.inject_max_fields;
    let mut shown = 0usize;
    let mut omitted = 0usize;
    for (entity_id, entity) in &doc.entities {
        for (domain, fields) in &entity.state {
            for (field, record) in fields {
                if shown < cap {
                    lines.push(format!(
                        "- [{entity_id}] {domain}.{field} = {} (confidence={:.3}, source={})",
                        summarize(&record.value),
                        record.confidence,
                        record.source
                    ));
                    shown += 1;
                } else {
                    omitted += 1;
                }
            }
        }
    }
    if omitted > 0 {
        lines.push(format!("- {omitted} more omitted"));
    }

    lines.push(String::new());
    lines.push(format!("Pending confirmations: {}", pending.len()));
    if let Some(active) = active_prompt(&pending, store)? {
        lines.push(format!(
            "Active pending check: {} {} = {}",
            &active.prompt_id[..8.min(active.prompt_id.len())],
            active.observation_event.field,
            summarize(&active.observation_event.candidate_value)
        ));
    }
    lines.push(SNAPSHOT_FOOTER.to_string());
    Ok(Some(lines.join("\n")))
}

/// The prompt the worker has in flight, falling back to the first pending.
fn active_prompt<'a>(
    pending: &[&'a PendingPrompt],
    store: &StateStore,
) -> Result<Option<&'a PendingPrompt>> {
    if pending.is_empty() {
        return Ok(None);
    }
    let state = load_worker_state(store)?;
    if let Some(active_id) = state.active_prompt_id.as_deref() {
        if let Some(p) = pending.iter().find(|p| p.prompt_id == active_id) {
            return Ok(Some(p));
        }
    }
    Ok(pending.first().copied())
}

// -------------------------------------------------------------------------
// Hook B: inbound-message ingestion
// -------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub conversation: String,
    pub message_id: String,
    pub from: String,
    pub from_self: bool,
    /// Seconds or milliseconds since the epoch; auto-detected.
    pub timestamp: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundOutcome {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

impl InboundOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            action: "skipped".to_string(),
            reason: Some(reason.to_string()),
            status: None,
            prompt_id: None,
        }
    }
}

fn event_ts_from(timestamp: i64) -> String {
    // Heuristic: anything above 1e11 is milliseconds.
    let (secs, millis) = if timestamp > 100_000_000_000 {
        (timestamp / 1000, (timestamp % 1000) as u32)
    } else {
        (timestamp, 0)
    };
    chrono::DateTime::from_timestamp(secs, millis * 1_000_000)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(crate::services::store::now_iso)
}

/// Hook B. Filters chatter, answers the active prompt when the text reads as
/// a decision, otherwise synthesizes a review-band observation.
pub fn handle_inbound(
    store: &StateStore,
    schemas: &SchemaSet,
    config: &EngineConfig,
    classifier: &IntentClassifier,
    msg: &InboundMessage,
) -> Result<InboundOutcome> {
    if msg.from_self {
        return Ok(InboundOutcome::skipped("self_message"));
    }
    if !config.ingest.channels.is_empty() && !config.ingest.channels.contains(&msg.channel) {
        return Ok(InboundOutcome::skipped("channel_disabled"));
    }
    if !config.ingest.allowed_senders.is_empty()
        && !config.ingest.allowed_senders.contains(&msg.from)
    {
        return Ok(InboundOutcome::skipped("sender_not_allowed"));
    }

    let text = msg.text.trim();
    if text.is_empty() {
        return Ok(InboundOutcome::skipped("empty"));
    }
    if text.starts_with('/') {
        return Ok(InboundOutcome::skipped("command"));
    }
    if text.chars().count() < config.ingest.min_chars {
        return Ok(InboundOutcome::skipped("too_short"));
    }
    if !text.chars().any(|c| c.is_alphabetic()) {
        return Ok(InboundOutcome::skipped("no_letters"));
    }
    if text.ends_with('?') {
        return Ok(InboundOutcome::skipped("question"));
    }

    // A natural answer to the active prompt wins over ingestion.
    let doc = store.load()?;
    let mut worker_state = load_worker_state(store)?;
    if let Some(active_id) = worker_state.active_prompt_id.clone() {
        if let Some(prompt) = doc.pending_confirmations.get(&active_id).cloned() {
            if let Some(reply) = parse_reply(text) {
                let addressed = match reply.prompt_ref.as_deref() {
                    None => true,
                    Some(candidate) => matches!(
                        resolve_prompt_ref(candidate, &[active_id.clone()]),
                        RefMatch::Unique(_)
                    ),
                };
                if addressed {
                    let (action, edited) = match reply.decision {
                        Decision::Confirm => ("confirm", None),
                        Decision::Reject => ("reject", None),
                        Decision::Edit(value) => ("edit", Some(json!(value))),
                        Decision::EditHelp => {
                            return Ok(InboundOutcome::skipped("edit_help"));
                        }
                    };
                    let payload = worker::confirmation_payload(&prompt, action, edited);
                    let outcome = lifecycle::apply_confirmation(store, schemas, &payload)?;
                    if outcome.status != ConfirmationStatus::NotFound {
                        worker_state.active_prompt_id = None;
                        worker_state.active_message_id = None;
                        save_worker_state(store, &worker_state)?;
                    }
                    return Ok(InboundOutcome {
                        action: "confirmation".to_string(),
                        reason: None,
                        status: Some(outcome.status.as_str().to_string()),
                        prompt_id: outcome.prompt_id,
                    });
                }
            }
        }
    }

    if doc.pending_confirmations.len() >= config.ingest.max_pending {
        return Ok(InboundOutcome::skipped("pending_limit"));
    }

    let domain = infer_domain(text);
    let intent = classifier.classify(schemas, domain, text);
    let identity = format!(
        "{}|{}|{}|{}|{}|{}",
        msg.channel, msg.conversation, msg.message_id, msg.from, msg.timestamp, text
    );
    let obs = observation_from_text(
        &config.system.entity_id,
        text,
        intent,
        &config.ingest.source_type,
        &format!(
            "message:{}:{}:{}",
            msg.channel, msg.conversation, msg.message_id
        ),
        Some(&format!("{domain}.current_assertion")),
        Some(deterministic_event_id(&identity)),
        Some(event_ts_from(msg.timestamp)),
    );
    let payload = serde_json::to_value(&obs)?;
    let outcome = pipeline::ingest(store, schemas, &payload, &IngestOptions::default())?;

    if outcome.status == IngestStatus::PendingConfirmation {
        if worker_state.active_prompt_id.is_none() {
            worker_state.active_prompt_id = outcome.prompt_id.clone();
            save_worker_state(store, &worker_state)?;
        }
    }
    if outcome.status == IngestStatus::Committed {
        if let Err(err) = projection::project(store, &config.paths.artifact) {
            tracing::warn!("projection after inbound commit failed: {err:#}");
        }
    }

    Ok(InboundOutcome {
        action: "ingested".to_string(),
        reason: None,
        status: Some(outcome.status.as_str().to_string()),
        prompt_id: outcome.prompt_id,
    })
}

// -------------------------------------------------------------------------
// /state-confirm command handler
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CommandReply {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl CommandReply {
    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }
}

fn decision_word(token: &str) -> Option<&'static str> {
    match token.to_lowercase().as_str() {
        "yes" | "confirm" => Some("confirm"),
        "no" | "reject" => Some("reject"),
        _ => None,
    }
}

fn looks_like_ref(token: &str) -> bool {
    token.len() >= 8 && token.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn parse_edit_value(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!(raw))
}

/// Handle `/state-confirm <args>`.
pub fn handle_command(
    store: &StateStore,
    schemas: &SchemaSet,
    config: &EngineConfig,
    args: &str,
) -> Result<CommandReply> {
    let doc = store.load()?;
    let pending = doc.pending_sorted();
    let all_ids: Vec<String> = pending.iter().map(|p| p.prompt_id.clone()).collect();

    let tokens: Vec<&str> = args.split_whitespace().collect();

    if tokens.is_empty() {
        return match active_prompt(&pending, store)? {
            Some(prompt) => Ok(show_prompt(prompt)),
            None => Ok(CommandReply::error("No pending confirmations.")),
        };
    }

    // `edit` alone, or `edit <ref> <value>`
    if tokens[0].eq_ignore_ascii_case("edit") {
        if tokens.len() >= 3 && looks_like_ref(tokens[1]) {
            let prompt = match lookup(&pending, tokens[1], &all_ids) {
                Ok(p) => p,
                Err(reply) => return Ok(reply),
            };
            let value = parse_edit_value(&tokens[2..].join(" "));
            return apply_and_advance(store, schemas, config, prompt, "edit", Some(value));
        }
        return Ok(CommandReply::error(EDIT_USAGE_HINT));
    }

    if looks_like_ref(tokens[0]) {
        let prompt = match lookup(&pending, tokens[0], &all_ids) {
            Ok(p) => p,
            Err(reply) => return Ok(reply),
        };
        if tokens.len() == 1 {
            return Ok(show_prompt(prompt));
        }
        if let Some(action) = decision_word(tokens[1]) {
            return apply_and_advance(store, schemas, config, prompt, action, None);
        }
        if tokens[1].eq_ignore_ascii_case("edit") && tokens.len() >= 3 {
            let value = parse_edit_value(&tokens[2..].join(" "));
            return apply_and_advance(store, schemas, config, prompt, "edit", Some(value));
        }
        return Ok(CommandReply::error(
            "Usage: /state-confirm <prompt_ref> [yes|no|confirm|reject|edit <value>]",
        ));
    }

    if let Some(action) = decision_word(tokens[0]) {
        // Reverse order: `yes <ref>`
        if tokens.len() >= 2 && looks_like_ref(tokens[1]) {
            let prompt = match lookup(&pending, tokens[1], &all_ids) {
                Ok(p) => p,
                Err(reply) => return Ok(reply),
            };
            return apply_and_advance(store, schemas, config, prompt, action, None);
        }
        return match active_prompt(&pending, store)? {
            Some(prompt) => {
                let prompt = prompt.clone();
                apply_and_advance(store, schemas, config, &prompt, action, None)
            }
            None => Ok(CommandReply::error("No pending confirmations.")),
        };
    }

    Ok(CommandReply::error(
        "Usage: /state-confirm [<prompt_ref>] [yes|no|confirm|reject|edit <value>]",
    ))
}

fn lookup<'a>(
    pending: &[&'a PendingPrompt],
    candidate: &str,
    all_ids: &[String],
) -> std::result::Result<&'a PendingPrompt, CommandReply> {
    match resolve_prompt_ref(candidate, all_ids) {
        RefMatch::Unique(id) => pending
            .iter()
            .find(|p| p.prompt_id == id)
            .copied()
            .ok_or_else(|| CommandReply::error(format!("No pending prompt matches '{candidate}'."))),
        RefMatch::Ambiguous(ids) => Err(CommandReply::error(format!(
            "Ambiguous prompt reference '{}': matches {}",
            candidate,
            ids.join(", ")
        ))),
        RefMatch::NotFound => Err(CommandReply::error(format!(
            "No pending prompt matches '{candidate}'."
        ))),
    }
}

fn show_prompt(prompt: &PendingPrompt) -> CommandReply {
    CommandReply {
        text: dispatch_text(prompt),
        buttons: dispatch_buttons(&prompt.prompt_id),
    }
}

fn apply_and_advance(
    store: &StateStore,
    schemas: &SchemaSet,
    config: &EngineConfig,
    prompt: &PendingPrompt,
    action: &str,
    edited_value: Option<Value>,
) -> Result<CommandReply> {
    let payload = worker::confirmation_payload(prompt, action, edited_value);
    let outcome = lifecycle::apply_confirmation(store, schemas, &payload)?;

    let ack = match (outcome.status, action) {
        (ConfirmationStatus::Committed, "edit") => "Updated with your edit.".to_string(),
        (ConfirmationStatus::Committed, _) => {
            format!("Confirmed. {} applied.", prompt.proposed_change)
        }
        (ConfirmationStatus::Rejected, _) => "Rejected. No state change.".to_string(),
        (status, _) => format!("Could not apply confirmation ({}).", status.as_str()),
    };

    // Keep the worker's view coherent and refresh the artifact.
    let mut state = load_worker_state(store)?;
    if state.active_prompt_id.as_deref() == Some(prompt.prompt_id.as_str()) {
        state.active_prompt_id = None;
        state.active_message_id = None;
        save_worker_state(store, &state)?;
    }
    if outcome.status == ConfirmationStatus::Committed {
        if let Err(err) = projection::project(store, &config.paths.artifact) {
            tracing::warn!("projection after command decision failed: {err:#}");
        }
    }

    let doc = store.load()?;
    let next = doc
        .pending_sorted()
        .into_iter()
        .find(|p| p.entity_id == prompt.entity_id)
        .cloned();
    match next {
        Some(next_prompt) => Ok(CommandReply {
            text: format!("{}\n\nNext: {}", ack, dispatch_text(&next_prompt)),
            buttons: dispatch_buttons(&next_prompt.prompt_id),
        }),
        None => Ok(CommandReply {
            text: format!("{ack}\n\nNo more pending confirmations."),
            buttons: Vec::new(),
        }),
    }
}
