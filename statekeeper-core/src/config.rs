use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use schemas::Intent;

/// Engine configuration. Loaded from `config.toml` at the state root when
/// present, otherwise pure defaults; environment variables override either.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub poller: PollerConfig,
}

impl EngineConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<EngineConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::debug!(
                "No config file found at {}. Using EngineConfig::default().",
                path.display()
            );
            EngineConfig::default()
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.paths.memory_dir = absolutize(root, &self.paths.memory_dir);
        self.paths.artifact = absolutize(root, &self.paths.artifact);
        self.paths.sessions_dir = absolutize(root, &self.paths.sessions_dir);
    }

    /// Apply the documented `STATE_*` environment overrides. The lookup is a
    /// closure so tests can inject values without touching process env.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("STATE_ENTITY_ID") {
            self.system.entity_id = v;
        }
        if let Some(v) = get("STATE_GOG_ACCOUNT") {
            self.poller.gog_account = Some(v);
        }
        if let Some(v) = get("STATE_POLLER_CRON_EXPR") {
            self.poller.cron_expr = Some(v);
        }
        if let Some(v) = get("STATE_REVIEW_MAX_PENDING").and_then(|v| v.parse().ok()) {
            self.review.max_pending = v;
        }
        if let Some(v) = get("STATE_REVIEW_LIMIT").and_then(|v| v.parse().ok()) {
            self.review.limit = v;
        }
        if let Some(v) = get("STATE_REVIEW_MIN_CONFIDENCE").and_then(|v| v.parse().ok()) {
            self.review.min_confidence = v;
        }
        if let Some(v) = get("STATE_TELEGRAM_TARGET") {
            self.review.target = Some(v);
        }
        if let Some(v) = get("STATE_TELEGRAM_THREAD_ID") {
            self.review.thread_id = Some(v);
        }
        if let Some(v) = get("STATE_TELEGRAM_REVIEW_INTERVAL").and_then(|v| v.parse().ok()) {
            self.review.interval_minutes = v;
        }
        if let Some(v) = get("STATE_INTENT_EXTRACTOR_MODE").and_then(|v| v.parse().ok()) {
            self.intent.mode = v;
        }
        if let Some(v) = get("STATE_INTENT_EXTRACTOR_CMD") {
            self.intent.command = Some(v);
        }
        if let Some(v) = get("STATE_ADAPTIVE_MODE").and_then(|v| v.parse().ok()) {
            self.adaptive.mode = v;
        }
        if let Some(v) = get("STATE_INGEST_CHANNELS") {
            self.ingest.channels = split_csv(&v);
        }
        if let Some(v) = get("STATE_INGEST_ALLOWED_SENDERS") {
            self.ingest.allowed_senders = split_csv(&v);
        }
        if let Some(v) = get("STATE_INGEST_MIN_CHARS").and_then(|v| v.parse().ok()) {
            self.ingest.min_chars = v;
        }
        if let Some(v) = get("STATE_INGEST_MAX_PENDING").and_then(|v| v.parse().ok()) {
            self.ingest.max_pending = v;
        }
        if let Some(v) = get("STATE_INGEST_SOURCE_TYPE") {
            self.ingest.source_type = v;
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            paths: PathsConfig::default(),
            review: ReviewConfig::default(),
            ingest: IngestConfig::default(),
            intent: IntentConfig::default(),
            adaptive: AdaptiveConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_entity_id")]
    pub entity_id: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "statekeeper".to_string()
    }

    fn default_entity_id() -> String {
        "user:primary".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            entity_id: Self::default_entity_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "PathsConfig::default_memory_dir")]
    pub memory_dir: PathBuf,
    #[serde(default = "PathsConfig::default_artifact")]
    pub artifact: PathBuf,
    #[serde(default = "PathsConfig::default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl PathsConfig {
    fn default_memory_dir() -> PathBuf {
        PathBuf::from("memory")
    }

    fn default_artifact() -> PathBuf {
        PathBuf::from("STATE.md")
    }

    fn default_sessions_dir() -> PathBuf {
        PathBuf::from("sessions")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            memory_dir: Self::default_memory_dir(),
            artifact: Self::default_artifact(),
            sessions_dir: Self::default_sessions_dir(),
        }
    }
}

/// Review-queue promotion and confirmation-loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "ReviewConfig::default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "ReviewConfig::default_limit")]
    pub limit: usize,
    #[serde(default = "ReviewConfig::default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default = "ReviewConfig::default_interval_minutes")]
    pub interval_minutes: u64,
    /// Command that delivers a chat message; stdin carries the JSON payload.
    #[serde(default)]
    pub send_cmd: Option<String>,
}

impl ReviewConfig {
    fn default_max_pending() -> usize {
        5
    }

    fn default_limit() -> usize {
        3
    }

    fn default_min_confidence() -> f64 {
        0.5
    }

    fn default_interval_minutes() -> u64 {
        10
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_pending: Self::default_max_pending(),
            limit: Self::default_limit(),
            min_confidence: Self::default_min_confidence(),
            target: None,
            thread_id: None,
            interval_minutes: Self::default_interval_minutes(),
            send_cmd: None,
        }
    }
}

/// Inbound-message ingestion hook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    #[serde(default = "IngestConfig::default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "IngestConfig::default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "IngestConfig::default_source_type")]
    pub source_type: String,
    #[serde(default = "IngestConfig::default_inject_max_fields")]
    pub inject_max_fields: usize,
}

impl IngestConfig {
    fn default_min_chars() -> usize {
        12
    }

    fn default_max_pending() -> usize {
        10
    }

    // Review band on purpose: a human sees conversational claims before they
    // commit. Raising this to conversation_assertive is a rollout decision.
    fn default_source_type() -> String {
        "conversation_planning".to_string()
    }

    fn default_inject_max_fields() -> usize {
        32
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            allowed_senders: Vec::new(),
            min_chars: Self::default_min_chars(),
            max_pending: Self::default_max_pending(),
            source_type: Self::default_source_type(),
            inject_max_fields: Self::default_inject_max_fields(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
    Rule,
    Command,
}

impl std::str::FromStr for IntentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule" => Ok(IntentMode::Rule),
            "command" => Ok(IntentMode::Command),
            other => Err(format!("unknown intent mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentConfig {
    #[serde(default = "IntentConfig::default_mode")]
    pub mode: IntentMode,
    #[serde(default)]
    pub command: Option<String>,
}

impl IntentConfig {
    fn default_mode() -> IntentMode {
        IntentMode::Rule
    }
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    Off,
    Shadow,
    Apply,
}

impl AdaptiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptiveMode::Off => "off",
            AdaptiveMode::Shadow => "shadow",
            AdaptiveMode::Apply => "apply",
        }
    }
}

impl std::str::FromStr for AdaptiveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(AdaptiveMode::Off),
            "shadow" => Ok(AdaptiveMode::Shadow),
            "apply" => Ok(AdaptiveMode::Apply),
            other => Err(format!("unknown adaptive mode: {other}")),
        }
    }
}

/// Adaptive threshold learner knobs. Gated off by default.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "AdaptiveConfig::default_mode")]
    pub mode: AdaptiveMode,
    #[serde(default = "AdaptiveConfig::default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "AdaptiveConfig::default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "AdaptiveConfig::default_max_daily_step")]
    pub max_daily_step: f64,
    #[serde(default = "AdaptiveConfig::default_target_correction_rate")]
    pub target_correction_rate: f64,
    #[serde(default = "AdaptiveConfig::default_low_confirmation_rate")]
    pub low_confirmation_rate: f64,
    #[serde(default = "AdaptiveConfig::default_high_confirmation_rate")]
    pub high_confirmation_rate: f64,
    #[serde(default = "AdaptiveConfig::default_min_interval_hours")]
    pub min_interval_hours: i64,
}

impl AdaptiveConfig {
    fn default_mode() -> AdaptiveMode {
        AdaptiveMode::Off
    }

    fn default_min_samples() -> usize {
        12
    }

    fn default_lookback_days() -> i64 {
        14
    }

    fn default_max_daily_step() -> f64 {
        0.02
    }

    fn default_target_correction_rate() -> f64 {
        0.08
    }

    fn default_low_confirmation_rate() -> f64 {
        0.55
    }

    fn default_high_confirmation_rate() -> f64 {
        0.85
    }

    fn default_min_interval_hours() -> i64 {
        20
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            min_samples: Self::default_min_samples(),
            lookback_days: Self::default_lookback_days(),
            max_daily_step: Self::default_max_daily_step(),
            target_correction_rate: Self::default_target_correction_rate(),
            low_confirmation_rate: Self::default_low_confirmation_rate(),
            high_confirmation_rate: Self::default_high_confirmation_rate(),
            min_interval_hours: Self::default_min_interval_hours(),
        }
    }
}

/// Fetcher wiring. `cron_expr` is consumed by the external scheduler; the
/// commands are invoked by `poll_signals` and print JSON arrays on stdout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub gog_account: Option<String>,
    #[serde(default)]
    pub calendar_cmd: Option<String>,
    #[serde(default)]
    pub email_cmd: Option<String>,
}

// -------------------------------------------------------------------------
// Default tables seeded into the canonical document at bootstrap
// -------------------------------------------------------------------------

/// Per-domain decision thresholds. Stored in the canonical document so the
/// adaptive learner can move them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainThresholds {
    pub ask_threshold: f64,
    pub auto_threshold: f64,
    pub margin_threshold: f64,
}

impl Default for DomainThresholds {
    fn default() -> Self {
        Self {
            ask_threshold: 0.60,
            auto_threshold: 0.90,
            margin_threshold: 0.15,
        }
    }
}

pub fn default_domain_table() -> BTreeMap<String, DomainThresholds> {
    schemas::Domain::ALL
        .iter()
        .map(|d| (d.as_str().to_string(), DomainThresholds::default()))
        .collect()
}

/// Baseline source reliability. Unknown source types resolve to 0.5.
pub fn default_source_reliability() -> BTreeMap<String, f64> {
    [
        ("user_confirmation", 0.98),
        ("conversation_assertive", 0.92),
        ("calendar_webhook", 0.90),
        ("calendar_poll", 0.85),
        ("email_webhook", 0.85),
        ("email_poll", 0.75),
        ("conversation_planning", 0.70),
        ("static_markdown", 0.60),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

pub const UNKNOWN_SOURCE_RELIABILITY: f64 = 0.5;

pub fn intent_factor(intent: Intent) -> f64 {
    match intent {
        Intent::Assertive => 1.00,
        Intent::Retract => 0.95,
        Intent::Planning => 0.72,
        Intent::Historical => 0.68,
        Intent::Hypothetical => 0.45,
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
