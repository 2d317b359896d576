//! Deterministic JSON canonicalization and content-derived identity.
//!
//! Policy:
//! - Canonical form sorts object keys recursively; arrays keep their order.
//! - Content-derived event ids are uuid5 over the canonical serialization, so
//!   the same identifying tuple always maps to the same id across processes.
//!
//! Keep this logic single-sourced: the signal adapter, the inbound-message
//! hook, and the tests all derive ids through here.

use serde_json::Value;
use uuid::Uuid;

/// Recursively sort object keys so serialization is order-independent.
pub fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => v.clone(),
    }
}

/// Canonical serialization of a JSON value (sorted keys, compact).
pub fn canonical_json(v: &Value) -> String {
    serde_json::to_string(&canonicalize(v)).expect("canonical json")
}

/// Deterministic RFC-4122 id for an identifying string: uuid5 in a fixed
/// engine namespace. Same input, same id — the idempotency anchor for
/// re-polled signals and replayed chat messages.
pub fn deterministic_event_id(input: &str) -> String {
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"statekeeper://event-id");
    Uuid::new_v5(&namespace, input.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [3, {"k": 4, "j": 5}]}});
        let b = json!({"a": {"x": [3, {"j": 5, "k": 4}], "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn deterministic_ids_are_stable_and_distinct() {
        let one = deterministic_event_id("calendar:poll:user:primary:evt-1:{}");
        let two = deterministic_event_id("calendar:poll:user:primary:evt-1:{}");
        let other = deterministic_event_id("calendar:poll:user:primary:evt-2:{}");
        assert_eq!(one, two);
        assert_ne!(one, other);
        // RFC-4122 shape
        assert_eq!(one.len(), 36);
        assert_eq!(one.matches('-').count(), 4);
    }
}
