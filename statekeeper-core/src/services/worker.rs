//! Confirmation-loop worker: one pending prompt in flight per
//! `(target, entity)`, advanced one tick at a time.
//!
//! Each tick reads the tail of the host-chat session file past a persisted
//! byte cursor, applies at most one user decision to the active prompt, then
//! dispatches the next pending prompt. The cursor resets to EOF on dispatch
//! so earlier chatter is never misattributed to the new prompt.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

use schemas::SchemaSet;

use crate::config::EngineConfig;
use crate::services::lifecycle::{self, ConfirmationStatus};
use crate::services::projection;
use crate::services::store::{now_iso, PendingPrompt, StateStore};
use crate::utils::fsio::{read_opt, write_atomic};

/// Inline keyboard button, wired to the control command.
#[derive(Debug, Clone, Serialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

/// The chat surface. Sending is the only external I/O the worker performs;
/// implementations shell out to the host's send command.
pub trait ChatTransport {
    /// Send a message; returns the host's message id.
    fn send(&self, target: &str, text: &str, buttons: &[Button]) -> Result<String>;
}

/// Persistent runtime state, sibling to the canonical document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default)]
    pub session_cursor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_prompt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decision_at: Option<String>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            version: 1,
            target: None,
            entity_id: String::new(),
            session_id: None,
            session_file: None,
            session_cursor: 0,
            active_prompt_id: None,
            active_message_id: None,
            last_dispatched_at: None,
            last_decision_at: None,
        }
    }
}

pub fn load_worker_state(store: &StateStore) -> Result<WorkerState> {
    match read_opt(&store.worker_state_path())? {
        Some(text) => serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", store.worker_state_path().display())),
        None => Ok(WorkerState::default()),
    }
}

pub fn save_worker_state(store: &StateStore, state: &WorkerState) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(state).context("serializing worker state")?;
    bytes.push(b'\n');
    write_atomic(&store.worker_state_path(), &bytes)
}

// -------------------------------------------------------------------------
// Reply parsing
// -------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Reject,
    EditHelp,
    Edit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub decision: Decision,
    pub prompt_ref: Option<String>,
}

const CONFIRM_TOKENS: [&str; 6] = ["confirm", "approved", "yes", "y", "ok", "okay"];
const REJECT_TOKENS: [&str; 4] = ["reject", "decline", "no", "n"];

fn looks_like_prompt_ref(token: &str) -> bool {
    token.len() >= 8 && token.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn action_of(token: &str) -> Option<&'static str> {
    let lower = token.to_lowercase();
    if CONFIRM_TOKENS.contains(&lower.as_str()) {
        Some("confirm")
    } else if REJECT_TOKENS.contains(&lower.as_str()) {
        Some("reject")
    } else if lower == "edit" {
        Some("edit")
    } else {
        None
    }
}

/// Parse one user utterance into a decision. `None` means "not a decision".
pub fn parse_reply(text: &str) -> Option<ParsedReply> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }

    // Callback-data strings from inline buttons.
    if let Some(rest) = t.strip_prefix("state_confirm:") {
        return Some(ParsedReply {
            decision: Decision::Confirm,
            prompt_ref: nonempty(rest),
        });
    }
    if let Some(rest) = t.strip_prefix("state_reject:") {
        return Some(ParsedReply {
            decision: Decision::Reject,
            prompt_ref: nonempty(rest),
        });
    }
    if let Some(rest) = t.strip_prefix("state_edit:") {
        return Some(ParsedReply {
            decision: Decision::EditHelp,
            prompt_ref: nonempty(rest),
        });
    }

    // "edit: <value>" / "edit - <value>" with no prompt reference.
    if t.len() > 4 && t[..4].eq_ignore_ascii_case("edit") {
        let rest = t[4..].trim_start();
        if let Some(value) = rest.strip_prefix(':').or_else(|| rest.strip_prefix('-')) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(ParsedReply {
                    decision: Decision::Edit(value.to_string()),
                    prompt_ref: None,
                });
            }
        }
    }

    let tokens: Vec<&str> = t.split_whitespace().collect();
    if tokens.len() == 1 {
        return match action_of(tokens[0])? {
            "confirm" => Some(ParsedReply {
                decision: Decision::Confirm,
                prompt_ref: None,
            }),
            "reject" => Some(ParsedReply {
                decision: Decision::Reject,
                prompt_ref: None,
            }),
            _ => Some(ParsedReply {
                decision: Decision::EditHelp,
                prompt_ref: None,
            }),
        };
    }

    // "(confirm|reject|edit) <prompt_id>[: value]", either token order.
    let (action, ref_token_index) = if let Some(a) = action_of(tokens[0]) {
        (a, 1usize)
    } else if let Some(a) = action_of(tokens[tokens.len() - 1]) {
        (a, 0usize)
    } else {
        return None;
    };

    let raw_ref = tokens.get(ref_token_index).copied().unwrap_or("");
    let candidate = raw_ref.trim_end_matches(':');
    let prompt_ref = if looks_like_prompt_ref(candidate) {
        Some(candidate.to_string())
    } else {
        None
    };

    match action {
        "confirm" => Some(ParsedReply {
            decision: Decision::Confirm,
            prompt_ref,
        }),
        "reject" => Some(ParsedReply {
            decision: Decision::Reject,
            prompt_ref,
        }),
        _ => {
            // edit: everything after the prompt ref is the new value.
            if prompt_ref.is_some() {
                let after = t
                    .find(raw_ref)
                    .map(|i| t[i + raw_ref.len()..].trim_start_matches(':').trim())
                    .unwrap_or("");
                if after.is_empty() {
                    Some(ParsedReply {
                        decision: Decision::EditHelp,
                        prompt_ref,
                    })
                } else {
                    Some(ParsedReply {
                        decision: Decision::Edit(after.to_string()),
                        prompt_ref,
                    })
                }
            } else {
                // "edit <free text>" without a ref is an edit of the active
                // prompt with that text as the value.
                let value = t[4..].trim();
                if value.is_empty() {
                    Some(ParsedReply {
                        decision: Decision::EditHelp,
                        prompt_ref: None,
                    })
                } else {
                    Some(ParsedReply {
                        decision: Decision::Edit(value.to_string()),
                        prompt_ref: None,
                    })
                }
            }
        }
    }
}

fn nonempty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefMatch {
    Unique(String),
    Ambiguous(Vec<String>),
    NotFound,
}

/// Resolve a full id or a >=8-char prefix against known prompt ids.
pub fn resolve_prompt_ref(candidate: &str, ids: &[String]) -> RefMatch {
    if candidate.len() < 8 {
        return RefMatch::NotFound;
    }
    let mut matches: Vec<String> = ids
        .iter()
        .filter(|id| id.as_str() == candidate || id.starts_with(candidate))
        .cloned()
        .collect();
    match matches.len() {
        0 => RefMatch::NotFound,
        1 => RefMatch::Unique(matches.remove(0)),
        _ => RefMatch::Ambiguous(matches),
    }
}

// -------------------------------------------------------------------------
// Session file reading
// -------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub id: String,
    pub ts: Option<String>,
    pub text: String,
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Most recently modified session file whose name mentions the target.
pub fn discover_session_file(sessions_dir: &Path, target: &str) -> Option<PathBuf> {
    let needle = sanitize(target);
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    let entries = fs::read_dir(sessions_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name()?.to_string_lossy().to_string();
        if !name.ends_with(".jsonl") || !sanitize(&name).contains(&needle) {
            continue;
        }
        let modified = entry.metadata().ok()?.modified().ok()?;
        if best.as_ref().map(|(m, _)| modified > *m).unwrap_or(true) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, p)| p)
}

fn message_text(v: &Value) -> Option<String> {
    let inner = v.get("message").unwrap_or(v);
    inner
        .get("text")
        .or_else(|| inner.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn message_role(v: &Value) -> Option<&str> {
    let inner = v.get("message").unwrap_or(v);
    inner
        .get("role")
        .or_else(|| inner.get("from").and_then(|f| f.get("role")))
        .and_then(Value::as_str)
}

fn message_id(v: &Value) -> String {
    let inner = v.get("message").unwrap_or(v);
    match inner.get("id").or_else(|| inner.get("message_id")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn message_ts(v: &Value) -> Option<String> {
    let inner = v.get("message").unwrap_or(v);
    inner
        .get("ts")
        .or_else(|| inner.get("timestamp"))
        .or_else(|| inner.get("date"))
        .map(|t| match t {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

/// Read user-role messages in `[cursor, EOF)`; returns messages + new cursor.
/// A cursor past EOF (rotated file) resets to the start.
pub fn read_new_messages(path: &Path, cursor: u64) -> Result<(Vec<SessionMessage>, u64)> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let len = bytes.len() as u64;
    let start = if cursor > len { 0 } else { cursor };
    let tail = &bytes[start as usize..];
    let text = String::from_utf8_lossy(tail);

    let mut messages = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(v) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if message_role(&v) != Some("user") {
            continue;
        }
        let Some(text) = message_text(&v) else {
            continue;
        };
        messages.push(SessionMessage {
            id: message_id(&v),
            ts: message_ts(&v),
            text,
        });
    }
    Ok((messages, len))
}

// -------------------------------------------------------------------------
// Tick
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub replies_seen: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_prompt_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

fn resolve_target(store: &StateStore, config: &EngineConfig, state: &WorkerState) -> Option<String> {
    if let Some(t) = config.review.target.as_deref().and_then(nonempty) {
        return Some(t);
    }
    if let Ok(Some(text)) = read_opt(&store.memory_dir().join("state-telegram-target.txt")) {
        if let Some(t) = nonempty(&text) {
            return Some(t);
        }
    }
    state.target.as_deref().and_then(nonempty)
}

fn clamp_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Build the confirmation payload the lifecycle expects, straight from the
/// stored prompt. Free-text fields re-clamp to schema bounds (code points,
/// matching the schema's maxLength).
pub fn confirmation_payload(
    prompt: &PendingPrompt,
    action: &str,
    edited_value: Option<Value>,
) -> Value {
    let mut change = clamp_chars(&prompt.proposed_change, 512);
    if change.is_empty() {
        change.push('-');
    }
    let reasons: Vec<String> = prompt
        .reason_summary
        .iter()
        .take(5)
        .map(|r| clamp_chars(r, 160))
        .collect();
    let mut payload = json!({
        "prompt_id": prompt.prompt_id,
        "entity_id": prompt.entity_id,
        "domain": prompt.domain,
        "proposed_change": change,
        "confidence": prompt.confidence,
        "reason_summary": reasons,
        "action": action,
        "ts": now_iso(),
    });
    if let Some(v) = edited_value {
        payload["edited_value"] = v;
    }
    payload
}

pub fn dispatch_buttons(prompt_id: &str) -> Vec<Button> {
    vec![
        Button {
            text: "Yes".to_string(),
            callback_data: format!("/state-confirm {prompt_id} yes"),
        },
        Button {
            text: "No".to_string(),
            callback_data: format!("/state-confirm {prompt_id} no"),
        },
    ]
}

pub fn dispatch_text(prompt: &PendingPrompt) -> String {
    format!(
        "Confirm state change {}? [{}] {} (confidence {:.3}). Reply yes/no, or `edit: <value>`.",
        &prompt.prompt_id[..8.min(prompt.prompt_id.len())],
        prompt.entity_id,
        prompt.proposed_change,
        prompt.confidence
    )
}

pub const EDIT_USAGE_HINT: &str =
    "To edit, reply: edit <prompt_id>: <new value> (or `edit: <new value>` for the active prompt).";

/// One bounded, synchronous tick.
pub fn tick(
    store: &StateStore,
    schemas: &SchemaSet,
    config: &EngineConfig,
    transport: &dyn ChatTransport,
) -> Result<TickReport> {
    let mut state = load_worker_state(store)?;
    if state.entity_id.is_empty() {
        state.entity_id = config.system.entity_id.clone();
    }
    let mut report = TickReport::default();

    let Some(target) = resolve_target(store, config, &state) else {
        report.notes.push("no_target".to_string());
        return Ok(report);
    };
    state.target = Some(target.clone());

    // Locate the session and read the unseen tail.
    let mut replies: Vec<SessionMessage> = Vec::new();
    if let Some(session_file) = discover_session_file(&config.paths.sessions_dir, &target) {
        let path_str = session_file.display().to_string();
        if state.session_file.as_deref() != Some(path_str.as_str()) {
            // New session file: start from the beginning of it.
            state.session_file = Some(path_str);
            state.session_id = session_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string());
            state.session_cursor = 0;
        }
        let (messages, cursor) = read_new_messages(&session_file, state.session_cursor)?;
        state.session_cursor = cursor;
        replies = messages;
    } else {
        report.notes.push("no_session_file".to_string());
    }
    report.replies_seen = replies.len();

    // Resolve the active prompt, if any.
    if let Some(active_id) = state.active_prompt_id.clone() {
        let doc = store.load()?;
        if !doc.pending_confirmations.contains_key(&active_id) {
            // Resolved elsewhere; the worker just forgets it.
            state.active_prompt_id = None;
            state.active_message_id = None;
        } else {
            let prompt = doc.pending_confirmations[&active_id].clone();
            let ids = vec![active_id.clone()];
            let decision = replies
                .iter()
                .rev()
                .filter_map(|m| parse_reply(&m.text))
                .find(|r| match r.prompt_ref.as_deref() {
                    None => true,
                    Some(candidate) => {
                        matches!(resolve_prompt_ref(candidate, &ids), RefMatch::Unique(_))
                    }
                });
            if let Some(reply) = decision {
                match reply.decision {
                    Decision::EditHelp => {
                        let _ = transport.send(&target, EDIT_USAGE_HINT, &[]);
                        report.notes.push("edit_help".to_string());
                    }
                    decision => {
                        let (action, edited) = match decision {
                            Decision::Confirm => ("confirm", None),
                            Decision::Reject => ("reject", None),
                            Decision::Edit(value) => ("edit", Some(json!(value))),
                            Decision::EditHelp => unreachable!(),
                        };
                        let payload = confirmation_payload(&prompt, action, edited);
                        let outcome = lifecycle::apply_confirmation(store, schemas, &payload)?;
                        let ack = match (outcome.status, action) {
                            (ConfirmationStatus::Committed, "edit") => {
                                "Updated with your edit.".to_string()
                            }
                            (ConfirmationStatus::Committed, _) => {
                                format!("Confirmed. {} applied.", prompt.proposed_change)
                            }
                            (ConfirmationStatus::Rejected, _) => {
                                "Rejected. No state change.".to_string()
                            }
                            (status, _) => {
                                format!("Could not apply confirmation ({}).", status.as_str())
                            }
                        };
                        let _ = transport.send(&target, &ack, &[]);
                        if outcome.status == ConfirmationStatus::Committed {
                            match projection::project(store, &config.paths.artifact) {
                                Ok(_) => {
                                    let _ = transport.send(&target, "Context synced.", &[]);
                                }
                                Err(err) => {
                                    tracing::warn!("projection after confirmation failed: {err:#}");
                                }
                            }
                        }
                        report.decision_status = Some(outcome.status.as_str().to_string());
                        state.active_prompt_id = None;
                        state.active_message_id = None;
                        state.last_decision_at = Some(now_iso());
                    }
                }
            }
        }
    }

    // Dispatch the next pending prompt for this entity.
    if state.active_prompt_id.is_none() {
        let doc = store.load()?;
        let next = doc
            .pending_sorted()
            .into_iter()
            .find(|p| p.entity_id == state.entity_id)
            .cloned();
        if let Some(prompt) = next {
            let message_id = transport.send(
                &target,
                &dispatch_text(&prompt),
                &dispatch_buttons(&prompt.prompt_id),
            )?;
            state.active_prompt_id = Some(prompt.prompt_id.clone());
            state.active_message_id = Some(message_id);
            state.last_dispatched_at = Some(now_iso());
            // Anything said before this dispatch must not resolve it.
            if let Some(session_file) = state.session_file.as_deref() {
                if let Ok(meta) = fs::metadata(session_file) {
                    state.session_cursor = meta.len();
                }
            }
            report.dispatched_prompt_id = Some(prompt.prompt_id);
        }
    }

    save_worker_state(store, &state)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_callback_data() {
        let r = parse_reply("state_confirm:7c9e6679-7425-40de-944b-e07fc1f90ae7").expect("parsed");
        assert_eq!(r.decision, Decision::Confirm);
        assert_eq!(
            r.prompt_ref.as_deref(),
            Some("7c9e6679-7425-40de-944b-e07fc1f90ae7")
        );

        let r = parse_reply("state_edit:7c9e6679").expect("parsed");
        assert_eq!(r.decision, Decision::EditHelp);
    }

    #[test]
    fn parses_bare_tokens() {
        for token in ["yes", "y", "ok", "okay", "approved", "confirm"] {
            assert_eq!(parse_reply(token).expect("parsed").decision, Decision::Confirm);
        }
        for token in ["no", "n", "reject", "decline"] {
            assert_eq!(parse_reply(token).expect("parsed").decision, Decision::Reject);
        }
        assert_eq!(parse_reply("edit").expect("parsed").decision, Decision::EditHelp);
        assert!(parse_reply("what's the weather").is_none());
    }

    #[test]
    fn parses_action_with_prompt_ref_in_either_order() {
        let r = parse_reply("confirm 7c9e6679").expect("parsed");
        assert_eq!(r.decision, Decision::Confirm);
        assert_eq!(r.prompt_ref.as_deref(), Some("7c9e6679"));

        let r = parse_reply("7c9e6679 reject").expect("parsed");
        assert_eq!(r.decision, Decision::Reject);
        assert_eq!(r.prompt_ref.as_deref(), Some("7c9e6679"));
    }

    #[test]
    fn parses_edit_variants() {
        let r = parse_reply("edit: Leave Saturday").expect("parsed");
        assert_eq!(r.decision, Decision::Edit("Leave Saturday".to_string()));
        assert_eq!(r.prompt_ref, None);

        let r = parse_reply("edit - Leave Saturday").expect("parsed");
        assert_eq!(r.decision, Decision::Edit("Leave Saturday".to_string()));

        let r = parse_reply("edit 7c9e6679: Leave Saturday").expect("parsed");
        assert_eq!(r.decision, Decision::Edit("Leave Saturday".to_string()));
        assert_eq!(r.prompt_ref.as_deref(), Some("7c9e6679"));

        let r = parse_reply("edit 7c9e6679").expect("parsed");
        assert_eq!(r.decision, Decision::EditHelp);
    }

    #[test]
    fn prompt_ref_resolution() {
        let ids = vec![
            "7c9e6679-7425-40de-944b-e07fc1f90ae7".to_string(),
            "7c9e6679-aaaa-40de-944b-e07fc1f90ae7".to_string(),
        ];
        assert_eq!(resolve_prompt_ref("7c9e66", &ids), RefMatch::NotFound);
        assert!(matches!(
            resolve_prompt_ref("7c9e6679", &ids),
            RefMatch::Ambiguous(_)
        ));
        assert_eq!(
            resolve_prompt_ref("7c9e6679-7425", &ids),
            RefMatch::Unique(ids[0].clone())
        );
    }
}
