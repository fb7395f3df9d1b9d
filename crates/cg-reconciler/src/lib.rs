//! ConfirmGuard Reconciler
//!
//! This crate turns the broker's two independent publish signals into one
//! resend decision per message:
//! - AckReconciler: state machine over unroutable returns and channel acks
//! - ReliablePublisher: registers a message before handing it to a transport
//! - FatalOutcomeClassifier: decides which consumer failures must never retry
//! - StagingSweeper: background task that releases stale staging entries

pub mod classifier;
pub mod publisher;
pub mod reconciler;
pub mod sweeper;

pub use classifier::{
    DefaultFatalStrategy, FailureCause, FailureDisposition, FatalOutcomeClassifier, FatalStrategy,
};
pub use publisher::{BrokerTransport, Confirmation, ReliablePublisher, ReturnedMessage};
pub use reconciler::{AckOutcome, AckReconciler, BrokerEvent, EventOutcome, UnroutableOutcome};
pub use sweeper::{StagingSweeper, SweeperConfig};

pub use cg_common::{ConfirmGuardError, Result};
