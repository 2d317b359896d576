//! Dead-letter queue: quarantine, fold, and the retry scheduler.
//!
//! The DLQ store is an append-only NDJSON log. The authoritative per-entry
//! state is obtained by folding all lines keyed by `dlq_id`, last write wins
//! per field. Malformed lines are counted, never fatal.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use schemas::SchemaSet;

use crate::services::lifecycle;
use crate::services::pipeline::{self, IngestOptions};
use crate::services::signal;
use crate::services::store::StateStore;
use crate::utils::fsio::{append_line, read_opt};

/// Retry backoff schedule; later retries reuse the last interval.
pub const BACKOFF_SECONDS: [i64; 4] = [60, 300, 1_800, 7_200];
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const STATUS_PENDING: &str = "pending_retry";
pub const STATUS_RESOLVED: &str = "resolved";
pub const STATUS_FAILED: &str = "failed_permanent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub schema_name: String,
    pub payload: Value,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub first_seen_ts: String,
    #[serde(default)]
    pub retry_count: u32,
    pub next_retry_ts: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result_status: Option<String>,
}

/// Folded view of the DLQ log.
#[derive(Debug, Default)]
pub struct DlqFold {
    pub entries: BTreeMap<String, DlqEntry>,
    pub malformed_lines: usize,
}

fn backoff_after(retry_count: u32) -> Duration {
    let idx = (retry_count as usize).min(BACKOFF_SECONDS.len() - 1);
    Duration::seconds(BACKOFF_SECONDS[idx])
}

/// Quarantine a schema-invalid payload. Returns the new `dlq_id`.
pub fn quarantine(
    store: &StateStore,
    schema_name: &str,
    payload: &Value,
    errors: &[String],
) -> Result<String> {
    let now = Utc::now();
    let entry = DlqEntry {
        dlq_id: Uuid::new_v4().to_string(),
        schema_name: schema_name.to_string(),
        payload: payload.clone(),
        validation_errors: errors.to_vec(),
        first_seen_ts: now.to_rfc3339(),
        retry_count: 0,
        next_retry_ts: (now + backoff_after(0)).to_rfc3339(),
        status: STATUS_PENDING.to_string(),
        last_retry_ts: None,
        last_result_status: None,
    };
    append_entry(store, &entry)?;
    tracing::debug!(dlq_id = %entry.dlq_id, schema = schema_name, "payload quarantined");
    Ok(entry.dlq_id)
}

fn append_entry(store: &StateStore, entry: &DlqEntry) -> Result<()> {
    let line = serde_json::to_string(entry).context("serializing dlq entry")?;
    append_line(&store.dlq_path(), &line)
}

/// Fold the log into per-entry state, last write wins per field.
pub fn fold(store: &StateStore) -> Result<DlqFold> {
    let mut merged: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
    let mut malformed = 0usize;

    if let Some(text) = read_opt(&store.dlq_path())? {
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
                malformed += 1;
                continue;
            };
            let Some(id) = obj.get("dlq_id").and_then(Value::as_str).map(String::from) else {
                malformed += 1;
                continue;
            };
            let slot = merged.entry(id).or_default();
            for (k, v) in obj {
                slot.insert(k, v);
            }
        }
    }

    let mut entries = BTreeMap::new();
    for (id, obj) in merged {
        match serde_json::from_value::<DlqEntry>(Value::Object(obj)) {
            Ok(entry) => {
                entries.insert(id, entry);
            }
            Err(_) => malformed += 1,
        }
    }
    Ok(DlqFold {
        entries,
        malformed_lines: malformed,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub limit: usize,
    pub max_retries: u32,
    pub include_not_due: bool,
    pub force_commit: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            include_not_due: false,
            force_commit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub dlq_id: String,
    pub schema_name: String,
    pub result_status: String,
    pub new_status: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RetrySummary {
    pub scanned: usize,
    pub attempted: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub failed_permanent: usize,
    pub malformed_lines: usize,
    pub results: Vec<RetryResult>,
}

fn is_resolved(schema_name: &str, result_status: &str) -> bool {
    match schema_name {
        "observation" => matches!(
            result_status,
            "committed" | "pending_confirmation" | "tentative" | "duplicate"
        ),
        "confirmation" => matches!(result_status, "committed" | "rejected"),
        "signal" => result_status == "ok",
        _ => false,
    }
}

fn is_permanent(result_status: &str) -> bool {
    matches!(result_status, "unsupported_schema" | "not_found" | "mismatch")
}

/// Replay quarantined payloads. Each attempt appends a fresh full-state line
/// for the entry; the fold picks up the newest state on the next run.
pub fn retry(
    store: &StateStore,
    schemas: &SchemaSet,
    opts: &RetryOptions,
) -> Result<RetrySummary> {
    let folded = fold(store)?;
    let now = Utc::now();

    let mut due: Vec<DlqEntry> = folded
        .entries
        .into_values()
        .filter(|e| e.status == STATUS_PENDING)
        .filter(|e| {
            opts.include_not_due
                || DateTime::parse_from_rfc3339(&e.next_retry_ts)
                    .map(|t| t.with_timezone(&Utc) <= now)
                    .unwrap_or(true)
        })
        .collect();
    due.sort_by(|a, b| a.first_seen_ts.cmp(&b.first_seen_ts));

    let mut summary = RetrySummary {
        scanned: due.len(),
        malformed_lines: folded.malformed_lines,
        ..RetrySummary::default()
    };

    let ingest_opts = IngestOptions {
        force_commit: opts.force_commit,
        quarantine_on_invalid: false,
    };

    for mut entry in due.into_iter().take(opts.limit) {
        summary.attempted += 1;

        let result_status = match entry.schema_name.as_str() {
            "observation" => pipeline::ingest(store, schemas, &entry.payload, &ingest_opts)?
                .status
                .as_str()
                .to_string(),
            "confirmation" => lifecycle::apply_confirmation_quietly(store, schemas, &entry.payload)?
                .status
                .as_str()
                .to_string(),
            "signal" => signal::ingest_signal(store, schemas, &entry.payload, &ingest_opts)?
                .status
                .clone(),
            _ => "unsupported_schema".to_string(),
        };

        entry.retry_count += 1;
        entry.last_retry_ts = Some(now.to_rfc3339());
        entry.last_result_status = Some(result_status.clone());

        if is_resolved(&entry.schema_name, &result_status) {
            entry.status = STATUS_RESOLVED.to_string();
            summary.resolved += 1;
        } else if is_permanent(&result_status) || entry.retry_count >= opts.max_retries {
            entry.status = STATUS_FAILED.to_string();
            summary.failed_permanent += 1;
        } else {
            entry.status = STATUS_PENDING.to_string();
            entry.next_retry_ts = (now + backoff_after(entry.retry_count)).to_rfc3339();
            summary.still_pending += 1;
        }

        summary.results.push(RetryResult {
            dlq_id: entry.dlq_id.clone(),
            schema_name: entry.schema_name.clone(),
            result_status,
            new_status: entry.status.clone(),
        });
        append_entry(store, &entry)?;
    }

    Ok(summary)
}
