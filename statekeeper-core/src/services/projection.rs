//! Projection engine: deterministic rewrite of the two machine-managed
//! zones inside a Markdown artifact.
//!
//! Zones are delimited by literal comment markers; the engine splices
//! between them without parsing Markdown. Output is a pure function of the
//! canonical document and the last 20 audit bullets, so re-projecting an
//! unchanged store is a byte-identical no-op that writes nothing.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::services::pipeline::display_value;
use crate::services::store::{Document, StateStore};
use crate::utils::fsio::{read_opt, write_atomic};

pub const CANONICAL_HEADING: &str = "Canonical State (Machine Managed)";
pub const CHANGELOG_HEADING: &str = "State Change Log (Machine Managed)";
pub const CANONICAL_ZONE: &str = "canonical_state";
pub const CHANGELOG_ZONE: &str = "state_change_log";
const CHANGELOG_LINES: usize = 20;

fn begin_marker(zone_id: &str) -> String {
    format!("<!-- STATE:BEGIN zone_id={zone_id} schema=v1 -->")
}

fn end_marker(zone_id: &str) -> String {
    format!("<!-- STATE:END zone_id={zone_id} -->")
}

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectionReport {
    pub wrote: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<String>,
    pub converted_legacy: bool,
}

/// Canonical-state body: committed records sorted by entity, domain, field
/// (the `BTreeMap`s already guarantee that order), then pending prompts by
/// `created_at`.
fn render_canonical_body(doc: &Document) -> String {
    let mut lines = Vec::new();
    for (entity_id, entity) in &doc.entities {
        for (domain, fields) in &entity.state {
            for (field, record) in fields {
                lines.push(format!(
                    "- [{entity_id}] {domain}.{field} = {} (confidence={:.3}, source={})",
                    display_value(&record.value),
                    record.confidence,
                    record.source
                ));
            }
        }
    }
    if lines.is_empty() {
        lines.push("- No committed state yet.".to_string());
    }

    lines.push(String::new());
    lines.push("### Pending Confirmations".to_string());
    lines.push(String::new());
    let pending = doc.pending_sorted();
    if pending.is_empty() {
        lines.push("- None".to_string());
    } else {
        for prompt in pending {
            lines.push(format!(
                "- {} | {}/{} | {} (confidence={:.3})",
                prompt.prompt_id,
                prompt.entity_id,
                prompt.domain,
                prompt.proposed_change,
                prompt.confidence
            ));
        }
    }
    lines.join("\n")
}

fn render_changelog_body(audit_tail: &[String]) -> String {
    if audit_tail.is_empty() {
        "- No state changes yet.".to_string()
    } else {
        audit_tail.join("\n")
    }
}

fn render_section(heading: &str, zone_id: &str, body: &str) -> String {
    format!(
        "## {heading}\n\n{}\n{body}\n{}",
        begin_marker(zone_id),
        end_marker(zone_id)
    )
}

fn extract_zone(content: &str, zone_id: &str) -> Option<String> {
    let begin = begin_marker(zone_id);
    let end = end_marker(zone_id);
    let bi = content.find(&begin)?;
    let after = bi + begin.len();
    let rel = content[after..].find(&end)?;
    Some(content[after..after + rel].trim_matches('\n').to_string())
}

/// Drop a managed section (zone-delimited or legacy heading-anchored) from
/// the artifact. Returns the remaining content and whether a legacy
/// (marker-less) section was removed.
fn strip_section(content: &str, heading: &str, zone_id: &str) -> (String, bool) {
    let heading_line = format!("## {heading}");
    let begin = begin_marker(zone_id);
    let end = end_marker(zone_id);

    let mut kept: Vec<&str> = Vec::new();
    let mut had_legacy = false;
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        if line.trim_end() == heading_line {
            // Skip the whole section: through the end marker when zoned,
            // through the next heading (exclusive) otherwise.
            let mut saw_marker = false;
            while let Some(peek) = lines.peek() {
                let trimmed = peek.trim_end();
                if trimmed == end {
                    lines.next();
                    saw_marker = true;
                    break;
                }
                if trimmed == begin {
                    saw_marker = true;
                    lines.next();
                    continue;
                }
                if !saw_marker && trimmed.starts_with("## ") {
                    break;
                }
                lines.next();
            }
            if !saw_marker {
                had_legacy = true;
            }
            continue;
        }
        if line.trim_end() == begin {
            // Orphan zone without its heading.
            for orphan in lines.by_ref() {
                if orphan.trim_end() == end {
                    break;
                }
            }
            continue;
        }
        kept.push(line);
    }

    (kept.join("\n"), had_legacy)
}

fn backup_path(artifact: &Path) -> PathBuf {
    PathBuf::from(format!("{}.bak", artifact.display()))
}

/// Rewrite both managed zones at the end of the artifact.
pub fn project(store: &StateStore, artifact: &Path) -> Result<ProjectionReport> {
    let mut doc = store.load()?;
    let existing = read_opt(artifact)?.unwrap_or_default();

    let canonical_body = render_canonical_body(&doc);

    let mut report = ProjectionReport::default();

    // Drift: the in-file body differs both from what we last wrote and from
    // what we are about to write. Someone edited a managed zone by hand.
    let zones = [
        (CANONICAL_HEADING, CANONICAL_ZONE, canonical_body.clone()),
        (
            CHANGELOG_HEADING,
            CHANGELOG_ZONE,
            render_changelog_body(&store.audit_tail(CHANGELOG_LINES)?),
        ),
    ];
    for (heading, zone_id, new_body) in &zones {
        let Some(in_file) = extract_zone(&existing, zone_id) else {
            continue;
        };
        let Some(persisted) = doc.runtime.projection_hashes.get(*heading) else {
            continue;
        };
        let in_file_hash = sha256_hex(&in_file);
        if &in_file_hash != persisted && in_file_hash != sha256_hex(new_body) {
            store.append_audit(&format!(
                "drift_detected | section={heading} | action=reconcile"
            ))?;
            report.drift.push((*heading).to_string());
        }
    }

    let (without_canonical, legacy_canonical) =
        strip_section(&existing, CANONICAL_HEADING, CANONICAL_ZONE);
    let (base, legacy_changelog) =
        strip_section(&without_canonical, CHANGELOG_HEADING, CHANGELOG_ZONE);
    let converting_legacy = (legacy_canonical || legacy_changelog)
        && doc.runtime.projection_mode == "legacy_string";
    if converting_legacy {
        write_atomic(&backup_path(artifact), existing.as_bytes())?;
        store.append_audit(&format!(
            "projection_legacy | action=convert | backup={}",
            backup_path(artifact).display()
        ))?;
        report.converted_legacy = true;
    }

    // Changelog renders after drift/legacy lines so this write is
    // self-consistent.
    let changelog_body = render_changelog_body(&store.audit_tail(CHANGELOG_LINES)?);

    let base = base.trim_end();
    let mut out = String::new();
    if !base.is_empty() {
        out.push_str(base);
        out.push_str("\n\n");
    }
    out.push_str(&render_section(
        CANONICAL_HEADING,
        CANONICAL_ZONE,
        &canonical_body,
    ));
    out.push_str("\n\n");
    out.push_str(&render_section(
        CHANGELOG_HEADING,
        CHANGELOG_ZONE,
        &changelog_body,
    ));
    out.push('\n');

    if out != existing {
        write_atomic(artifact, out.as_bytes())?;
        report.wrote = true;
    }

    let canonical_hash = sha256_hex(&canonical_body);
    let changelog_hash = sha256_hex(&changelog_body);
    let hashes_changed = doc.runtime.projection_hashes.get(CANONICAL_HEADING)
        != Some(&canonical_hash)
        || doc.runtime.projection_hashes.get(CHANGELOG_HEADING) != Some(&changelog_hash);
    if hashes_changed {
        doc.runtime
            .projection_hashes
            .insert(CANONICAL_HEADING.to_string(), canonical_hash);
        doc.runtime
            .projection_hashes
            .insert(CHANGELOG_HEADING.to_string(), changelog_hash);
        store.save(&mut doc)?;
    }

    Ok(report)
}
