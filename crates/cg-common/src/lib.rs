use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved cache namespace bridging an unroutable return and its channel ack
pub const STAGING_NAMESPACE: &str = "staging";

// ============================================================================
// Core Message Types
// ============================================================================

/// A published message as held in the correlation cache.
///
/// Carries everything a resend job needs to publish it again. Entries are
/// cloned out of the cache and never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CachedMessage {
    pub fn new(
        id: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            content_type: None,
            created_at: Utc::now(),
        }
    }

    /// Build a message with a JSON payload
    pub fn json(
        id: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Result<Self> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| ConfirmGuardError::Serialization(e.to_string()))?;
        Ok(Self::new(id, exchange, routing_key, body).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Identifies a cached message: the bucket it waits in and its per-publish id.
///
/// Attached to a publish as `Option<CorrelationKey>`; `None` means the caller
/// opted out of caching and the message is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub bucket: String,
    pub id: String,
}

impl CorrelationKey {
    pub fn new(bucket: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            id: id.into(),
        }
    }

    /// Key with a fresh UUID v4 id
    pub fn generate(bucket: impl Into<String>) -> Self {
        Self::new(bucket, uuid::Uuid::new_v4().to_string())
    }

    pub fn is_staging(&self) -> bool {
        self.bucket == STAGING_NAMESPACE
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.id)
    }
}

// ============================================================================
// Reconciliation States
// ============================================================================

/// Where a tracked message is in its confirm/return lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Registered in its bucket, no broker feedback yet
    Pending,
    /// Returned as unroutable, parked in staging until the ack arrives
    Returned,
    /// Routed and accepted, removed from retry state
    Delivered,
    /// Sitting in its bucket waiting for the resend job
    NeedsResend,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::NeedsResend)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Returned => "returned",
            MessageState::Delivered => "delivered",
            MessageState::NeedsResend => "needs_resend",
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfirmGuardError {
    #[error("Namespace '{0}' is reserved")]
    ReservedNamespace(String),

    #[error("Invalid correlation key: {0}")]
    InvalidKey(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ConfirmGuardError>;
