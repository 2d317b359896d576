//! Canonical store: the single authoritative document plus its sibling logs.
//!
//! - One pretty-printed JSON document holds committed records, pending
//!   prompts, tentatives, processed-event ids, runtime config, and counters.
//! - Every mutation path loads, mutates in memory, and saves via atomic
//!   replace. Single-writer by design; multi-process deployments serialize
//!   writers externally.
//! - The audit trail is an append-only Markdown bullet log; the DLQ and
//!   learning-event logs are append-only NDJSON siblings.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use schemas::StateObservation;

use crate::config::{default_domain_table, default_source_reliability, DomainThresholds};
use crate::utils::fsio::{append_line, read_opt, write_atomic};

pub const PROCESSED_EVENT_CAP: usize = 5_000;
pub const TENTATIVE_CAP: usize = 1_000;

pub const DOCUMENT_FILE: &str = "state-tracker.json";
pub const AUDIT_FILE: &str = "state-changes.md";
pub const DLQ_FILE: &str = "state-dlq.jsonl";
pub const LEARNING_EVENTS_FILE: &str = "state-learning-events.jsonl";
pub const WORKER_STATE_FILE: &str = "state-telegram-review-state.json";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// One committed fact per `(entity_id, domain, field)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub value: Value,
    pub last_update: String,
    pub source: String,
    pub confidence: f64,
    pub event_id: String,
}

/// An ask-user decision awaiting a human action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub prompt_id: String,
    pub entity_id: String,
    pub domain: String,
    pub proposed_change: String,
    pub confidence: f64,
    pub reason_summary: Vec<String>,
    pub action: String,
    pub observation_event: StateObservation,
    pub source: String,
    pub created_at: String,
}

/// A low-confidence observation stashed without mutating state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TentativeObservation {
    #[serde(flatten)]
    pub observation: StateObservation,
    pub observed_at: String,
    pub confidence: f64,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// Learner runtime state carried inside the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRuntime {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_recommendations: BTreeMap<String, DomainThresholds>,
}

impl Default for AdaptiveRuntime {
    fn default() -> Self {
        Self {
            mode: "off".to_string(),
            last_run_at: None,
            last_recommendations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub projection_mode: String,
    pub adaptive_learning_enabled: bool,
    #[serde(default)]
    pub adaptive_learning: AdaptiveRuntime,
    #[serde(default)]
    pub projection_hashes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_review_queue_at: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            projection_mode: "legacy_string".to_string(),
            adaptive_learning_enabled: false,
            adaptive_learning: AdaptiveRuntime::default(),
            projection_hashes: BTreeMap::new(),
            last_poll_at: None,
            last_review_queue_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningStats {
    #[serde(default)]
    pub auto_commits: u64,
    #[serde(default)]
    pub ask_user_prompts: u64,
    #[serde(default)]
    pub tentative_rejects: u64,
    #[serde(default)]
    pub ask_user_confirmations: u64,
    #[serde(default)]
    pub user_confirms: u64,
    #[serde(default)]
    pub user_rejects: u64,
    #[serde(default)]
    pub user_edits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// domain → field → record
    #[serde(default)]
    pub state: BTreeMap<String, BTreeMap<String, StateRecord>>,
}

/// The canonical document. All maps are `BTreeMap` so serialization order,
/// and therefore projection output, is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    pub last_consistency_check: String,
    #[serde(default)]
    pub runtime: RuntimeState,
    #[serde(default = "default_domain_table")]
    pub domains: BTreeMap<String, DomainThresholds>,
    #[serde(default = "default_source_reliability")]
    pub source_reliability: BTreeMap<String, f64>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityState>,
    #[serde(default)]
    pub tentative_observations: Vec<TentativeObservation>,
    #[serde(default)]
    pub active_conflicts: Vec<Value>,
    #[serde(default)]
    pub pending_confirmations: BTreeMap<String, PendingPrompt>,
    #[serde(default)]
    pub processed_event_ids: Vec<String>,
    #[serde(default)]
    pub learning_stats: LearningStats,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: 1,
            last_consistency_check: now_iso(),
            runtime: RuntimeState::default(),
            domains: default_domain_table(),
            source_reliability: default_source_reliability(),
            entities: BTreeMap::new(),
            tentative_observations: Vec::new(),
            active_conflicts: Vec::new(),
            pending_confirmations: BTreeMap::new(),
            processed_event_ids: Vec::new(),
            learning_stats: LearningStats::default(),
        }
    }
}

impl Document {
    pub fn record(&self, entity_id: &str, domain: &str, field: &str) -> Option<&StateRecord> {
        self.entities
            .get(entity_id)?
            .state
            .get(domain)?
            .get(field)
    }

    pub fn set_record(&mut self, entity_id: &str, domain: &str, field: &str, record: StateRecord) {
        self.entities
            .entry(entity_id.to_string())
            .or_default()
            .state
            .entry(domain.to_string())
            .or_default()
            .insert(field.to_string(), record);
    }

    /// Remove a record, pruning empty maps so a retract leaves the document
    /// equivalent to never-committed for that field.
    pub fn remove_record(&mut self, entity_id: &str, domain: &str, field: &str) -> bool {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return false;
        };
        let Some(fields) = entity.state.get_mut(domain) else {
            return false;
        };
        let removed = fields.remove(field).is_some();
        if fields.is_empty() {
            entity.state.remove(domain);
        }
        if entity.state.is_empty() {
            self.entities.remove(entity_id);
        }
        removed
    }

    pub fn is_processed(&self, event_id: &str) -> bool {
        self.processed_event_ids.iter().any(|id| id == event_id)
    }

    /// Record an event id, evicting the oldest beyond the cap.
    pub fn note_processed(&mut self, event_id: &str) {
        self.processed_event_ids.push(event_id.to_string());
        while self.processed_event_ids.len() > PROCESSED_EVENT_CAP {
            self.processed_event_ids.remove(0);
        }
    }

    pub fn push_tentative(&mut self, tentative: TentativeObservation) {
        self.tentative_observations.push(tentative);
        while self.tentative_observations.len() > TENTATIVE_CAP {
            self.tentative_observations.remove(0);
        }
    }

    /// Pending prompts in dispatch order: `created_at` asc, prompt id as the
    /// tiebreak so ordering is stable across restarts.
    pub fn pending_sorted(&self) -> Vec<&PendingPrompt> {
        let mut prompts: Vec<&PendingPrompt> = self.pending_confirmations.values().collect();
        prompts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.prompt_id.cmp(&b.prompt_id))
        });
        prompts
    }

    pub fn committed_record_count(&self) -> usize {
        self.entities
            .values()
            .flat_map(|e| e.state.values())
            .map(|fields| fields.len())
            .sum()
    }
}

/// Paths + persistence for the canonical document and its sibling logs.
#[derive(Debug, Clone)]
pub struct StateStore {
    memory_dir: PathBuf,
}

impl StateStore {
    /// Bind the store to a memory directory. Creation of the directory and
    /// seed files happens in `commands::init`; this is purely path wiring.
    pub fn open(memory_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory_dir: memory_dir.into(),
        }
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    pub fn document_path(&self) -> PathBuf {
        self.memory_dir.join(DOCUMENT_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.memory_dir.join(AUDIT_FILE)
    }

    pub fn dlq_path(&self) -> PathBuf {
        self.memory_dir.join(DLQ_FILE)
    }

    pub fn learning_events_path(&self) -> PathBuf {
        self.memory_dir.join(LEARNING_EVENTS_FILE)
    }

    pub fn worker_state_path(&self) -> PathBuf {
        self.memory_dir.join(WORKER_STATE_FILE)
    }

    /// Load the document; a missing file yields the bootstrap defaults.
    pub fn load(&self) -> Result<Document> {
        match read_opt(&self.document_path())? {
            Some(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", self.document_path().display())),
            None => Ok(Document::default()),
        }
    }

    /// Atomic save. Stamps `last_consistency_check`; pretty JSON + trailing
    /// newline.
    pub fn save(&self, doc: &mut Document) -> Result<()> {
        doc.last_consistency_check = now_iso();
        let mut bytes = serde_json::to_vec_pretty(doc).context("serializing document")?;
        bytes.push(b'\n');
        write_atomic(&self.document_path(), &bytes)
    }

    /// Append one audit bullet: `- <iso> | <message>`.
    pub fn append_audit(&self, message: &str) -> Result<()> {
        append_line(&self.audit_path(), &format!("- {} | {}", now_iso(), message))
    }

    /// Last `n` audit bullets, oldest first.
    pub fn audit_tail(&self, n: usize) -> Result<Vec<String>> {
        let Some(text) = read_opt(&self.audit_path())? else {
            return Ok(Vec::new());
        };
        let lines: Vec<String> = text
            .lines()
            .filter(|l| l.starts_with("- "))
            .map(|l| l.to_string())
            .collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].to_vec())
    }
}
