// statekeeper-core/src/commands/init.rs

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::services::store::{Document, StateStore};

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
    pub config: EngineConfig,
}

/// Resolve the state root. Allow override via STATE_ROOT_DIR (tests/installs).
pub fn state_root() -> PathBuf {
    std::env::var_os("STATE_ROOT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Ensure the root, the canonical document, and the sibling logs exist.
/// Idempotent; safe to call often.
pub fn ensure_initialized_at(root: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    let config = EngineConfig::load(root)?;
    let memory_dir = &config.paths.memory_dir;

    if memory_dir.exists() {
        existed.push("memory".to_string());
    } else {
        fs::create_dir_all(memory_dir)
            .with_context(|| format!("create_dir_all({})", memory_dir.display()))?;
        created.push("memory".to_string());
    }

    let store = StateStore::open(memory_dir.clone());
    if store.document_path().exists() {
        existed.push("state-tracker.json".to_string());
    } else {
        let mut doc = Document::default();
        store.save(&mut doc)?;
        created.push("state-tracker.json".to_string());
    }

    for (name, path) in [
        ("state-changes.md", store.audit_path()),
        ("state-dlq.jsonl", store.dlq_path()),
        ("state-learning-events.jsonl", store.learning_events_path()),
    ] {
        if path.exists() {
            existed.push(name.to_string());
        } else {
            fs::write(&path, b"").with_context(|| format!("creating {}", path.display()))?;
            created.push(name.to_string());
        }
    }

    if !created.is_empty() {
        tracing::info!(root = %root.display(), created = ?created, "state root initialized");
    }

    Ok(InitReport {
        root: root.to_path_buf(),
        created,
        existed,
        config,
    })
}

/// Same, with the root resolved from the environment.
pub fn ensure_initialized() -> Result<InitReport> {
    let root = state_root();
    ensure_initialized_at(&root)
}

// ---------- single global init gate ----------

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Idempotent global initializer for long-running hosts whose hooks fire
/// often. Returns a &'static InitReport once initialization has completed.
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(ensure_initialized)
}
