//! Intent classification: built-in rule scoring, optional external command.
//!
//! `command` mode spawns a child process with a JSON request on stdin and
//! expects schema-valid JSON on stdout. Free-form classifier output is never
//! accepted; any failure (spawn, timeout-by-host, parse, schema) falls back
//! to the rule classifier.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::{json, Value};

use schemas::{Domain, Intent, SchemaName, SchemaSet};

use crate::config::{IntentConfig, IntentMode};

const RETRACT_MARKERS: [&str; 7] = [
    "forget",
    "remove",
    "no longer",
    "not anymore",
    "never mind",
    "scratch that",
    "cancel that",
];

const HYPOTHETICAL_MARKERS: [&str; 6] = [
    "what if",
    "maybe",
    "might",
    "hypothetically",
    "suppose",
    "could be",
];

const HISTORICAL_MARKERS: [&str; 6] = [
    "last year",
    "used to",
    "back then",
    "previously",
    "in the past",
    "when we lived",
];

const PLANNING_MARKERS: [&str; 8] = [
    "plan",
    "planning",
    "will ",
    "going to",
    "next week",
    "next month",
    "tomorrow",
    "schedule",
];

/// Few-shot examples shipped to the external classifier so its outputs stay
/// anchored to the same label semantics as the rule matcher.
const FEW_SHOT_EXAMPLES: [(&str, &str); 5] = [
    ("We're going to Tahoe next weekend", "planning"),
    ("My office is in Denver", "assertive"),
    ("Maybe we'll move next year", "hypothetical"),
    ("We used to live in Austin", "historical"),
    ("Forget the Tahoe trip", "retract"),
];

#[derive(Debug, Clone)]
pub struct IntentClassifier {
    mode: IntentMode,
    command: Option<String>,
}

impl IntentClassifier {
    pub fn from_config(cfg: &IntentConfig) -> Self {
        Self {
            mode: cfg.mode,
            command: cfg.command.clone(),
        }
    }

    pub fn rule_only() -> Self {
        Self {
            mode: IntentMode::Rule,
            command: None,
        }
    }

    pub fn classify(&self, schemas: &SchemaSet, domain: Domain, text: &str) -> Intent {
        match (self.mode, self.command.as_deref()) {
            (IntentMode::Command, Some(cmd)) => match classify_via_command(schemas, cmd, domain, text)
            {
                Ok(intent) => intent,
                Err(err) => {
                    tracing::warn!("intent command failed, falling back to rules: {err:#}");
                    rule_classify(text)
                }
            },
            _ => rule_classify(text),
        }
    }
}

/// Keyword scoring; the highest-scoring bucket wins, ties resolve in marker
/// priority order, no hits means assertive.
pub fn rule_classify(text: &str) -> Intent {
    let lower = text.to_lowercase();
    let count = |markers: &[&str]| markers.iter().filter(|m| lower.contains(*m)).count();

    let scored = [
        (Intent::Retract, count(&RETRACT_MARKERS)),
        (Intent::Hypothetical, count(&HYPOTHETICAL_MARKERS)),
        (Intent::Historical, count(&HISTORICAL_MARKERS)),
        (Intent::Planning, count(&PLANNING_MARKERS)),
    ];
    let best = scored
        .iter()
        .max_by_key(|(_, n)| *n)
        .filter(|(_, n)| *n > 0);
    match best {
        Some((intent, _)) => *intent,
        None => Intent::Assertive,
    }
}

fn classify_via_command(
    schemas: &SchemaSet,
    cmd: &str,
    domain: Domain,
    text: &str,
) -> anyhow::Result<Intent> {
    let mut parts = cmd.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty intent command"))?;

    let request = json!({
        "task": "intent_classification",
        "domain": domain.as_str(),
        "text": text,
        "allowed_intents": Intent::ALL.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
        "output_schema": { "intent": "one of allowed_intents", "confidence": "0..1", "reason": "string" },
        "few_shot_prompt": FEW_SHOT_EXAMPLES
            .iter()
            .map(|(t, i)| json!({ "text": t, "intent": i }))
            .collect::<Vec<_>>(),
    });

    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(serde_json::to_string(&request)?.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        anyhow::bail!(
            "classifier exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let parsed: Value = serde_json::from_slice(&output.stdout)?;
    schemas
        .validate(SchemaName::IntentResult, &parsed)
        .map_err(|errs| anyhow::anyhow!("classifier output invalid: {}", errs.join("; ")))?;
    let intent = parsed
        .get("intent")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("classifier output missing intent"))?;
    intent.parse::<Intent>().map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_buckets() {
        assert_eq!(rule_classify("We live in Denver"), Intent::Assertive);
        assert_eq!(rule_classify("We're going to Tahoe next week"), Intent::Planning);
        assert_eq!(rule_classify("Maybe we should move"), Intent::Hypothetical);
        assert_eq!(rule_classify("We used to live in Austin"), Intent::Historical);
        assert_eq!(rule_classify("Forget the Tahoe trip"), Intent::Retract);
    }

    #[test]
    fn retract_wins_ties() {
        // One retract marker, one planning marker.
        assert_eq!(rule_classify("Forget the plan"), Intent::Retract);
    }

    #[test]
    fn command_mode_falls_back_to_rules_on_spawn_failure() {
        let schemas = SchemaSet::compile().expect("schemas");
        let classifier = IntentClassifier {
            mode: IntentMode::Command,
            command: Some("/nonexistent/intent-classifier-binary".to_string()),
        };
        let intent = classifier.classify(&schemas, Domain::Travel, "We're going to Tahoe next week");
        assert_eq!(intent, Intent::Planning);
    }
}
