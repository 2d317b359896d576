//! Strict Draft-7 validation for the three inbound payload shapes.
//!
//! Schemas are embedded (no file I/O at validation time) and compiled once.
//! They are strict by policy: `additionalProperties: false`, closed
//! enumerations, uuid/RFC-3339 patterns, entity-id regex, and length bounds
//! on every free-text field. A schema that fails to compile is a fatal
//! startup error.

use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Value};

const UUID_PATTERN: &str =
    "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";
const TIMESTAMP_PATTERN: &str =
    "^\\d{4}-\\d{2}-\\d{2}[Tt]\\d{2}:\\d{2}:\\d{2}(\\.\\d+)?([Zz]|[+-]\\d{2}:\\d{2})$";
const ENTITY_PATTERN: &str = "^(user|family|team):[a-z0-9._-]+$";
const FIELD_PATTERN: &str = "^[a-z][a-z0-9_]*(\\.[a-z0-9_]+)*$";

const DOMAINS: [&str; 7] = [
    "travel",
    "family",
    "project",
    "financial",
    "profile",
    "school",
    "general",
];
const INTENTS: [&str; 5] = [
    "assertive",
    "planning",
    "hypothetical",
    "historical",
    "retract",
];

/// Which embedded schema to validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaName {
    Observation,
    Confirmation,
    Signal,
    IntentResult,
}

impl SchemaName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaName::Observation => "observation",
            SchemaName::Confirmation => "confirmation",
            SchemaName::Signal => "signal",
            SchemaName::IntentResult => "intent_result",
        }
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchemaName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(SchemaName::Observation),
            "confirmation" => Ok(SchemaName::Confirmation),
            "signal" => Ok(SchemaName::Signal),
            "intent_result" => Ok(SchemaName::IntentResult),
            other => Err(format!("unsupported schema: {other}")),
        }
    }
}

struct Compiled {
    #[allow(dead_code)]
    schema: Value,
    validator: JSONSchema,
}

impl Compiled {
    fn build(name: &str, schema: Value) -> Result<Self> {
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| anyhow!("compiling {name} schema: {e}"))?;
        Ok(Self { schema, validator })
    }
}

/// The compiled schema registry. Construct once at startup and share.
pub struct SchemaSet {
    observation: Compiled,
    confirmation: Compiled,
    signal: Compiled,
    intent_result: Compiled,
}

impl SchemaSet {
    pub fn compile() -> Result<Self> {
        Ok(Self {
            observation: Compiled::build("observation", observation_schema())
                .context("observation schema")?,
            confirmation: Compiled::build("confirmation", confirmation_schema())
                .context("confirmation schema")?,
            signal: Compiled::build("signal", signal_schema()).context("signal schema")?,
            intent_result: Compiled::build("intent_result", intent_result_schema())
                .context("intent_result schema")?,
        })
    }

    /// Validate a payload. `Ok(())` on pass, the full error list on failure.
    pub fn validate(&self, name: SchemaName, payload: &Value) -> Result<(), Vec<String>> {
        let compiled = match name {
            SchemaName::Observation => &self.observation,
            SchemaName::Confirmation => &self.confirmation,
            SchemaName::Signal => &self.signal,
            SchemaName::IntentResult => &self.intent_result,
        };
        let result = compiled.validator.validate(payload);
        match result {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect()),
        }
    }
}

fn source_ref_schema(closed_type: bool) -> Value {
    let type_schema = if closed_type {
        json!({ "enum": crate::types::SOURCE_TYPES })
    } else {
        json!({ "type": "string", "minLength": 1, "maxLength": 64 })
    };
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "ref"],
        "properties": {
            "type": type_schema,
            "ref": { "type": "string", "minLength": 1, "maxLength": 512 }
        }
    })
}

fn observation_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "StateObservation",
        "type": "object",
        "additionalProperties": false,
        "required": [
            "event_id", "event_ts", "domain", "entity_id", "field",
            "candidate_value", "intent", "source"
        ],
        "properties": {
            "event_id": { "type": "string", "pattern": UUID_PATTERN },
            "event_ts": { "type": "string", "pattern": TIMESTAMP_PATTERN },
            "domain": { "enum": DOMAINS },
            "entity_id": { "type": "string", "pattern": ENTITY_PATTERN },
            "field": {
                "type": "string",
                "minLength": 1,
                "maxLength": 128,
                "pattern": FIELD_PATTERN
            },
            "candidate_value": {},
            "intent": { "enum": INTENTS },
            "source": source_ref_schema(true),
            "corroborators": {
                "type": "array",
                "maxItems": 16,
                "items": source_ref_schema(false)
            }
        }
    })
}

fn confirmation_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "UserConfirmation",
        "type": "object",
        "additionalProperties": false,
        "required": [
            "prompt_id", "entity_id", "domain", "proposed_change",
            "confidence", "action", "ts"
        ],
        "properties": {
            "prompt_id": { "type": "string", "pattern": UUID_PATTERN },
            "entity_id": { "type": "string", "pattern": ENTITY_PATTERN },
            "domain": { "enum": DOMAINS },
            "proposed_change": { "type": "string", "minLength": 1, "maxLength": 512 },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "reason_summary": {
                "type": "array",
                "maxItems": 5,
                "items": { "type": "string", "maxLength": 160 }
            },
            "action": { "enum": ["confirm", "reject", "edit"] },
            "edited_value": {},
            "ts": { "type": "string", "pattern": TIMESTAMP_PATTERN }
        },
        "allOf": [
            {
                "if": { "properties": { "action": { "const": "edit" } } },
                "then": { "required": ["edited_value"] }
            },
            {
                "if": { "properties": { "action": { "enum": ["confirm", "reject"] } } },
                "then": { "not": { "required": ["edited_value"] } }
            }
        ]
    })
}

fn signal_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "SignalEvent",
        "type": "object",
        "additionalProperties": false,
        "required": ["signal_id", "event_ts", "source", "entity_id", "items"],
        "properties": {
            "signal_id": { "type": "string", "pattern": UUID_PATTERN },
            "event_ts": { "type": "string", "pattern": TIMESTAMP_PATTERN },
            "source": {
                "type": "object",
                "additionalProperties": false,
                "required": ["kind", "mode", "ref"],
                "properties": {
                    "kind": { "enum": ["calendar", "email"] },
                    "mode": { "enum": ["poll", "webhook"] },
                    "ref": { "type": "string", "minLength": 1, "maxLength": 512 }
                }
            },
            "entity_id": { "type": "string", "pattern": ENTITY_PATTERN },
            "items": {
                "type": "array",
                "maxItems": 256,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["domain", "field", "ref", "value", "intent"],
                    "properties": {
                        "domain": { "enum": DOMAINS },
                        "field": {
                            "type": "string",
                            "minLength": 1,
                            "maxLength": 128,
                            "pattern": FIELD_PATTERN
                        },
                        "ref": { "type": "string", "minLength": 1, "maxLength": 512 },
                        "value": {},
                        "intent": { "enum": INTENTS },
                        "corroborators": {
                            "type": "array",
                            "maxItems": 16,
                            "items": source_ref_schema(false)
                        }
                    }
                }
            }
        }
    })
}

/// Output contract for the optional external intent classifier.
fn intent_result_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "IntentResult",
        "type": "object",
        "additionalProperties": false,
        "required": ["intent"],
        "properties": {
            "intent": { "enum": INTENTS },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "reason": { "type": "string", "maxLength": 512 },
            "domain": { "enum": DOMAINS }
        }
    })
}
