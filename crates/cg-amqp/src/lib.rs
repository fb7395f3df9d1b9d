//! ConfirmGuard AMQP transport
//!
//! - AmqpTransport: publishes with `mandatory` set on a confirm-mode channel
//!   and reports returns together with the confirmation
//! - ConsumerErrorHandler: settles failed deliveries using the fatal-outcome
//!   classifier

pub mod consumer;
pub mod transport;

pub use consumer::ConsumerErrorHandler;
pub use transport::AmqpTransport;
