//! Free-text to observation: fixed keyword domain inference and the
//! observation skeleton used by the inbound hook and ad-hoc callers.
//!
//! Keep the keyword tables single-sourced here; the signal adapter reuses
//! them for calendar/email text.

use serde_json::json;
use uuid::Uuid;

use schemas::{Domain, Intent, SourceRef, StateObservation};

use crate::services::store::now_iso;

const TRAVEL_KEYWORDS: [&str; 10] = [
    "flight",
    "trip",
    "travel",
    "hotel",
    "airport",
    "itinerary",
    "drive to",
    "leave for",
    "departure",
    "vacation",
];

const FAMILY_KEYWORDS: [&str; 9] = [
    "family",
    "kids",
    "son",
    "daughter",
    "mom",
    "dad",
    "grandma",
    "grandpa",
    "anniversary",
];

const FINANCIAL_KEYWORDS: [&str; 10] = [
    "budget",
    "invoice",
    "payment",
    "salary",
    "rent",
    "mortgage",
    "bank",
    "tax",
    "subscription",
    "bill",
];

const PROJECT_KEYWORDS: [&str; 8] = [
    "project",
    "deadline",
    "sprint",
    "release",
    "milestone",
    "deliverable",
    "launch",
    "ticket",
];

const PROFILE_KEYWORDS: [&str; 7] = [
    "my name",
    "phone number",
    "email address",
    "birthday",
    "address",
    "timezone",
    "pronouns",
];

const SCHOOL_KEYWORDS: [&str; 8] = [
    "school",
    "class",
    "lesson",
    "homework",
    "teacher",
    "semester",
    "tuition",
    "exam",
];

fn matches_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Fixed keyword matcher. Family claims that also mention school/class/lesson
/// refine to `school`.
pub fn infer_domain(text: &str) -> Domain {
    let lower = text.to_lowercase();
    if matches_any(&lower, &TRAVEL_KEYWORDS) {
        Domain::Travel
    } else if matches_any(&lower, &FAMILY_KEYWORDS) {
        if matches_any(&lower, &SCHOOL_KEYWORDS) {
            Domain::School
        } else {
            Domain::Family
        }
    } else if matches_any(&lower, &FINANCIAL_KEYWORDS) {
        Domain::Financial
    } else if matches_any(&lower, &PROJECT_KEYWORDS) {
        Domain::Project
    } else if matches_any(&lower, &PROFILE_KEYWORDS) {
        Domain::Profile
    } else if matches_any(&lower, &SCHOOL_KEYWORDS) {
        Domain::School
    } else {
        Domain::General
    }
}

/// Build an observation from free text. Domain is inferred unless the caller
/// overrides the field; the default field is `<domain>.note`.
#[allow(clippy::too_many_arguments)]
pub fn observation_from_text(
    entity_id: &str,
    text: &str,
    intent: Intent,
    source_type: &str,
    source_ref: &str,
    field_override: Option<&str>,
    event_id: Option<String>,
    event_ts: Option<String>,
) -> StateObservation {
    let domain = infer_domain(text);
    let field = field_override
        .map(|f| f.to_string())
        .unwrap_or_else(|| format!("{domain}.note"));
    StateObservation {
        event_id: event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        event_ts: event_ts.unwrap_or_else(now_iso),
        domain,
        entity_id: entity_id.to_string(),
        field,
        candidate_value: json!(text),
        intent,
        source: SourceRef::new(source_type, source_ref),
        corroborators: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_inference_picks_first_matching_bucket() {
        assert_eq!(infer_domain("Booked the flight to Tahoe"), Domain::Travel);
        assert_eq!(infer_domain("Rent is due on the 1st"), Domain::Financial);
        assert_eq!(infer_domain("Sprint review moved to Thursday"), Domain::Project);
        assert_eq!(infer_domain("Nothing special here"), Domain::General);
    }

    #[test]
    fn family_with_school_words_refines_to_school() {
        assert_eq!(infer_domain("My daughter has a piano lesson"), Domain::School);
        assert_eq!(infer_domain("My daughter loves hiking"), Domain::Family);
        assert_eq!(infer_domain("Homework is due Monday"), Domain::School);
    }

    #[test]
    fn free_text_observation_defaults() {
        let obs = observation_from_text(
            "user:primary",
            "Booked the flight to Tahoe",
            Intent::Assertive,
            "conversation_assertive",
            "thread:9",
            None,
            None,
            None,
        );
        assert_eq!(obs.domain, Domain::Travel);
        assert_eq!(obs.field, "travel.note");
        assert_eq!(obs.stored_field(), "note");
        assert_eq!(obs.source.kind, "conversation_assertive");
    }
}
