// Public modules so statekeeper-core can use them
pub mod canonical;
pub mod types;
pub mod validate;

pub use canonical::{canonical_json, canonicalize, deterministic_event_id};
pub use types::{
    ConfirmAction, Domain, Intent, SignalEvent, SignalItem, SignalSource, SourceKind, SourceMode,
    SourceRef, StateObservation, UserConfirmation,
};
pub use validate::{SchemaName, SchemaSet};
