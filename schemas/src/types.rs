//! Wire payloads accepted at the engine boundary.
//!
//! Every inbound shape is one of three payloads (`observation`, `signal`,
//! `confirmation`); enumerations here are closed and mirrored 1:1 by the
//! schema documents in `validate`. Keep the two in sync.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fact namespace. Every stored record is keyed by `(entity_id, domain, field)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Travel,
    Family,
    Project,
    Financial,
    Profile,
    School,
    General,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Travel,
        Domain::Family,
        Domain::Project,
        Domain::Financial,
        Domain::Profile,
        Domain::School,
        Domain::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Travel => "travel",
            Domain::Family => "family",
            Domain::Project => "project",
            Domain::Financial => "financial",
            Domain::Profile => "profile",
            Domain::School => "school",
            Domain::General => "general",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain: {s}"))
    }
}

/// How the speaker meant the claim. Scales confidence (see the resolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Assertive,
    Planning,
    Hypothetical,
    Historical,
    Retract,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Assertive,
        Intent::Planning,
        Intent::Hypothetical,
        Intent::Historical,
        Intent::Retract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Assertive => "assertive",
            Intent::Planning => "planning",
            Intent::Hypothetical => "hypothetical",
            Intent::Historical => "historical",
            Intent::Retract => "retract",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intent::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| format!("unknown intent: {s}"))
    }
}

/// Upstream signal family for batched inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Calendar,
    Email,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Calendar => "calendar",
            SourceKind::Email => "email",
        }
    }
}

/// How the signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Poll,
    Webhook,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Poll => "poll",
            SourceMode::Webhook => "webhook",
        }
    }
}

/// User decision on a pending prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmAction {
    Confirm,
    Reject,
    Edit,
}

impl ConfirmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmAction::Confirm => "confirm",
            ConfirmAction::Reject => "reject",
            ConfirmAction::Edit => "edit",
        }
    }
}

/// `{type, ref}` pair naming where a claim (or corroboration) came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reference: reference.into(),
        }
    }
}

/// An input claim that some field has a candidate value.
///
/// `candidate_value = null` with `intent = retract` means "remove the field".
/// `field` carries the `domain.` prefix on the wire; the store strips it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateObservation {
    pub event_id: String,
    pub event_ts: String,
    pub domain: Domain,
    pub entity_id: String,
    pub field: String,
    #[serde(default)]
    pub candidate_value: Value,
    pub intent: Intent,
    pub source: SourceRef,
    #[serde(default)]
    pub corroborators: Vec<SourceRef>,
}

impl StateObservation {
    /// Field name as stored, with the `domain.` prefix stripped.
    pub fn stored_field(&self) -> &str {
        let prefix = self.domain.as_str();
        match self.field.strip_prefix(prefix) {
            Some(rest) => rest.strip_prefix('.').unwrap_or(&self.field),
            None => &self.field,
        }
    }

    /// True when this observation removes the field instead of setting it.
    pub fn is_retraction(&self) -> bool {
        self.intent == Intent::Retract && self.candidate_value.is_null()
    }
}

/// Origin header of a batched signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSource {
    pub kind: SourceKind,
    pub mode: SourceMode,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// One claim inside a signal batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalItem {
    pub domain: Domain,
    pub field: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub value: Value,
    pub intent: Intent,
    #[serde(default)]
    pub corroborators: Vec<SourceRef>,
}

/// Batched external input (calendar poll, mail poll, webhook push).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal_id: String,
    pub event_ts: String,
    pub source: SignalSource,
    pub entity_id: String,
    pub items: Vec<SignalItem>,
}

/// A human decision resolving a pending prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfirmation {
    pub prompt_id: String,
    pub entity_id: String,
    pub domain: Domain,
    pub proposed_change: String,
    pub confidence: f64,
    #[serde(default)]
    pub reason_summary: Vec<String>,
    pub action: ConfirmAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_value: Option<Value>,
    pub ts: String,
}

/// The closed set of observation source types with baseline reliability.
/// Order matters only for documentation; the resolver looks reliability up in
/// the canonical document.
pub const SOURCE_TYPES: [&str; 8] = [
    "user_confirmation",
    "conversation_assertive",
    "conversation_planning",
    "calendar_poll",
    "calendar_webhook",
    "email_poll",
    "email_webhook",
    "static_markdown",
];
