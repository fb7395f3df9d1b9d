//! ConfirmGuard Correlation Cache
//!
//! In-memory registry of named buckets holding messages that may need a
//! resend, plus the reserved staging area used between an unroutable return
//! and its channel ack. Process lifetime only; nothing is persisted.

pub mod store;

pub use store::{CorrelationCache, StagedMessage};
