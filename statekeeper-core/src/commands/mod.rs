// src/commands/mod.rs
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use schemas::SchemaSet;

use crate::config::EngineConfig;
use crate::services::bridge::{self, CommandReply, InboundMessage, InboundOutcome};
use crate::services::dlq::{self, RetryOptions, RetrySummary};
use crate::services::extract;
use crate::services::intent::IntentClassifier;
use crate::services::learner::{self, LearnerOptions, LearnerReport};
use crate::services::lifecycle::{self, ConfirmationOutcome, PromoteOptions, PromoteOutcome};
use crate::services::pipeline::{self, IngestOptions, IngestOutcome};
use crate::services::projection::{self, ProjectionReport};
use crate::services::signal::{self, SignalSummary};
use crate::services::store::{StateStore, PROCESSED_EVENT_CAP, TENTATIVE_CAP};
use crate::services::transport::{self, CommandTransport};
use crate::services::worker::{self, ChatTransport, TickReport};

pub mod init;

pub use init::{
    ensure_initialized, ensure_initialized_at, ensure_initialized_once, state_root, InitReport,
};

/// The engine facade: one schema registry, one store binding, one config.
pub struct Commands {
    config: EngineConfig,
    schemas: SchemaSet,
    store: StateStore,
    classifier: IntentClassifier,
}

impl Commands {
    /// Open at the environment-resolved root, bootstrapping files as needed.
    pub fn new() -> Result<Self> {
        let report = ensure_initialized()?;
        Self::from_init(report)
    }

    /// Open at a specific root (primarily for tests/tools).
    pub fn open_at(root: &Path) -> Result<Self> {
        let report = ensure_initialized_at(root)?;
        Self::from_init(report)
    }

    fn from_init(report: InitReport) -> Result<Self> {
        let schemas = SchemaSet::compile()?;
        let store = StateStore::open(report.config.paths.memory_dir.clone());
        let classifier = IntentClassifier::from_config(&report.config.intent);
        Ok(Self {
            config: report.config,
            schemas,
            store,
            classifier,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    pub fn ingest(&self, payload: &Value, force_commit: bool) -> Result<IngestOutcome> {
        let opts = IngestOptions {
            force_commit,
            ..IngestOptions::default()
        };
        pipeline::ingest(&self.store, &self.schemas, payload, &opts)
    }

    /// Extract an observation from free text and ingest it.
    pub fn ingest_text(
        &self,
        text: &str,
        field_override: Option<&str>,
        force_commit: bool,
    ) -> Result<IngestOutcome> {
        let domain = extract::infer_domain(text);
        let intent = self.classifier.classify(&self.schemas, domain, text);
        let obs = extract::observation_from_text(
            &self.config.system.entity_id,
            text,
            intent,
            &self.config.ingest.source_type,
            "cli:text",
            field_override,
            None,
            None,
        );
        let payload = serde_json::to_value(&obs)?;
        self.ingest(&payload, force_commit)
    }

    pub fn ingest_signal(&self, payload: &Value, force_commit: bool) -> Result<SignalSummary> {
        let opts = IngestOptions {
            force_commit,
            ..IngestOptions::default()
        };
        signal::ingest_signal(&self.store, &self.schemas, payload, &opts)
    }

    // ---------------------------------------------------------------------
    // Confirmation lifecycle
    // ---------------------------------------------------------------------

    pub fn apply_confirmation(&self, payload: &Value) -> Result<ConfirmationOutcome> {
        lifecycle::apply_confirmation(&self.store, &self.schemas, payload)
    }

    pub fn promote_review_queue(
        &self,
        entity_id: Option<String>,
        domain: Option<String>,
    ) -> Result<PromoteOutcome> {
        let opts = PromoteOptions {
            entity_id,
            domain,
            min_confidence: self.config.review.min_confidence,
            limit: self.config.review.limit,
            max_pending: self.config.review.max_pending,
        };
        lifecycle::promote_review_queue(&self.store, &opts)
    }

    // ---------------------------------------------------------------------
    // Periodic tasks
    // ---------------------------------------------------------------------

    pub fn retry_dlq(&self, opts: &RetryOptions) -> Result<RetrySummary> {
        dlq::retry(&self.store, &self.schemas, opts)
    }

    pub fn project(&self) -> Result<ProjectionReport> {
        projection::project(&self.store, &self.config.paths.artifact)
    }

    pub fn learner_run(&self, force: bool) -> Result<LearnerReport> {
        learner::run(&self.store, &self.config.adaptive, &LearnerOptions { force })
    }

    pub fn worker_tick(&self, transport: &dyn ChatTransport) -> Result<TickReport> {
        worker::tick(&self.store, &self.schemas, &self.config, transport)
    }

    /// The configured send-command transport, when one is set.
    pub fn chat_transport(&self) -> Option<CommandTransport> {
        CommandTransport::from_config(&self.config.review)
    }

    /// One poll pass: invoke the configured fetchers, map their output into
    /// signals, ingest, and refresh the artifact when anything committed.
    pub fn poll_signals(&self) -> Result<PollSummary> {
        let entity = &self.config.system.entity_id;
        let account = self
            .config
            .poller
            .gog_account
            .as_deref()
            .unwrap_or("primary");
        let mut summary = PollSummary {
            calendar: None,
            email: None,
        };

        if let Some(cmd) = self.config.poller.calendar_cmd.as_deref() {
            let events = transport::run_fetcher(cmd, &[])?;
            let signal =
                signal::signal_from_calendar_events(entity, &format!("gog:cal:{account}"), &events);
            let payload = serde_json::to_value(&signal)?;
            summary.calendar = Some(signal::ingest_signal(
                &self.store,
                &self.schemas,
                &payload,
                &IngestOptions::default(),
            )?);
        }
        if let Some(cmd) = self.config.poller.email_cmd.as_deref() {
            let threads = transport::run_fetcher(cmd, &[])?;
            let signal =
                signal::signal_from_email_threads(entity, &format!("gog:mail:{account}"), &threads);
            let payload = serde_json::to_value(&signal)?;
            summary.email = Some(signal::ingest_signal(
                &self.store,
                &self.schemas,
                &payload,
                &IngestOptions::default(),
            )?);
        }

        let committed = [&summary.calendar, &summary.email]
            .into_iter()
            .flatten()
            .map(|s| s.committed)
            .sum::<usize>();
        if committed > 0 {
            if let Err(err) = self.project() {
                tracing::warn!("projection after poll failed: {err:#}");
            }
        }
        Ok(summary)
    }

    // ---------------------------------------------------------------------
    // Host-chat bridge
    // ---------------------------------------------------------------------

    pub fn prepend_context(&self) -> Result<Option<String>> {
        bridge::prepend_context(&self.store, &self.config)
    }

    pub fn handle_inbound(&self, msg: &InboundMessage) -> Result<InboundOutcome> {
        bridge::handle_inbound(&self.store, &self.schemas, &self.config, &self.classifier, msg)
    }

    pub fn handle_command(&self, args: &str) -> Result<CommandReply> {
        bridge::handle_command(&self.store, &self.schemas, &self.config, args)
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    pub fn doctor(&self) -> Result<DoctorReport> {
        let mut checks = Vec::new();

        checks.push(match self.store.load() {
            Ok(_) => DoctorCheck::pass("document"),
            Err(err) => DoctorCheck::fail(
                "document",
                format!("canonical document unreadable: {err:#}. Restore from backup or re-init."),
            ),
        });

        let fold = dlq::fold(&self.store)?;
        checks.push(if fold.malformed_lines == 0 {
            DoctorCheck::pass("dlq")
        } else {
            DoctorCheck::fail(
                "dlq",
                format!(
                    "{} malformed DLQ lines; folding skips them but the log deserves a look.",
                    fold.malformed_lines
                ),
            )
        });

        let target_ok = self.config.review.target.is_some()
            || self
                .store
                .memory_dir()
                .join("state-telegram-target.txt")
                .exists();
        checks.push(if target_ok {
            DoctorCheck::pass("chat_target")
        } else {
            DoctorCheck::fail(
                "chat_target",
                "no chat target configured; set STATE_TELEGRAM_TARGET or the side-car file."
                    .to_string(),
            )
        });

        let intent_ok = match (&self.config.intent.mode, &self.config.intent.command) {
            (crate::config::IntentMode::Command, Some(cmd)) => cmd
                .split_whitespace()
                .next()
                .map(|p| Path::new(p).exists())
                .unwrap_or(false),
            (crate::config::IntentMode::Command, None) => false,
            _ => true,
        };
        checks.push(if intent_ok {
            DoctorCheck::pass("intent_classifier")
        } else {
            DoctorCheck::fail(
                "intent_classifier",
                "intent mode is 'command' but the command is missing; rule fallback will be used."
                    .to_string(),
            )
        });

        checks.push(
            if self
                .config
                .paths
                .artifact
                .parent()
                .map(Path::exists)
                .unwrap_or(true)
            {
                DoctorCheck::pass("artifact_dir")
            } else {
                DoctorCheck::fail(
                    "artifact_dir",
                    format!(
                        "projection target directory missing: {}",
                        self.config.paths.artifact.display()
                    ),
                )
            },
        );

        for (name, cmd) in [
            ("calendar_fetcher", &self.config.poller.calendar_cmd),
            ("email_fetcher", &self.config.poller.email_cmd),
        ] {
            let Some(cmd) = cmd.as_deref() else {
                continue;
            };
            let present = cmd
                .split_whitespace()
                .next()
                .map(|p| Path::new(p).exists() || !p.contains('/'))
                .unwrap_or(false);
            checks.push(if present {
                DoctorCheck::pass(name)
            } else {
                DoctorCheck::fail(
                    name,
                    format!("configured fetcher is missing on disk: {cmd}"),
                )
            });
        }

        let ok = checks.iter().all(|c| c.ok);
        Ok(DoctorReport { ok, checks })
    }

    pub fn stats(&self) -> Result<StatsReport> {
        let doc = self.store.load()?;
        let fold = dlq::fold(&self.store)?;
        Ok(StatsReport {
            entities: doc.entities.len(),
            committed_records: doc.committed_record_count(),
            pending_confirmations: doc.pending_confirmations.len(),
            tentative_observations: doc.tentative_observations.len(),
            processed_event_ids: doc.processed_event_ids.len(),
            dlq_pending: fold
                .entries
                .values()
                .filter(|e| e.status == dlq::STATUS_PENDING)
                .count(),
            dlq_failed: fold
                .entries
                .values()
                .filter(|e| e.status == dlq::STATUS_FAILED)
                .count(),
            learning_stats: doc.learning_stats.clone(),
        })
    }

    /// Walk the document invariants without mutating anything.
    pub fn verify_consistency(&self) -> Result<ConsistencyReport> {
        let doc = self.store.load()?;
        let mut violations = Vec::new();

        for (entity_id, entity) in &doc.entities {
            for (domain, fields) in &entity.state {
                for (field, record) in fields {
                    if !doc.is_processed(&record.event_id) {
                        violations.push(format!(
                            "committed record {entity_id}/{domain}.{field} event {} missing from processed_event_ids",
                            record.event_id
                        ));
                    }
                }
            }
        }
        if doc.processed_event_ids.len() > PROCESSED_EVENT_CAP {
            violations.push(format!(
                "processed_event_ids over cap: {}",
                doc.processed_event_ids.len()
            ));
        }
        if doc.tentative_observations.len() > TENTATIVE_CAP {
            violations.push(format!(
                "tentative_observations over cap: {}",
                doc.tentative_observations.len()
            ));
        }
        for (prompt_id, prompt) in &doc.pending_confirmations {
            if prompt.entity_id != prompt.observation_event.entity_id
                || prompt.domain != prompt.observation_event.domain.as_str()
            {
                violations.push(format!(
                    "pending prompt {prompt_id} disagrees with its stored observation"
                ));
            }
            if doc.record(
                &prompt.observation_event.entity_id,
                prompt.observation_event.domain.as_str(),
                prompt.observation_event.stored_field(),
            )
            .map(|r| r.event_id == prompt.observation_event.event_id)
            .unwrap_or(false)
            {
                violations.push(format!(
                    "pending prompt {prompt_id} observation already committed under its own event id"
                ));
            }
        }
        for tentative in &doc.tentative_observations {
            if tentative.prompt_id.is_some() && tentative.promoted_at.is_none() {
                violations.push(format!(
                    "tentative {} has a prompt_id but no promoted_at",
                    tentative.observation.event_id
                ));
            }
        }

        Ok(ConsistencyReport {
            ok: violations.is_empty(),
            violations,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar: Option<SignalSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<SignalSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DoctorCheck {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            hint: None,
        }
    }

    fn fail(name: &str, hint: String) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            hint: Some(hint),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub entities: usize,
    pub committed_records: usize,
    pub pending_confirmations: usize,
    pub tentative_observations: usize,
    pub processed_event_ids: usize,
    pub dlq_pending: usize,
    pub dlq_failed: usize,
    pub learning_stats: crate::services::store::LearningStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub ok: bool,
    pub violations: Vec<String>,
}
