// src/services/mod.rs

pub mod bridge;     // host-chat hooks + /state-confirm handler
pub mod dlq;        // quarantine, fold, retry scheduler
pub mod extract;    // free-text -> observation
pub mod intent;     // rule/command intent classifier
pub mod learner;    // adaptive threshold learner
pub mod lifecycle;  // confirmations + review-queue promotion
pub mod pipeline;   // the ingest path
pub mod projection; // machine-managed Markdown zones
pub mod resolver;   // confidence + decision
pub mod signal;     // calendar/email batches
pub mod store;      // the canonical document, the ONLY document writer
pub mod transport;  // chat send command + fetcher invocation
pub mod worker;     // confirmation-loop ticks

// Public API
pub use store::{Document, StateStore};
