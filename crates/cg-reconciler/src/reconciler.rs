//! AckReconciler - combines unroutable returns and channel acks
//!
//! The broker reports a publish twice and independently: an optional return
//! when no queue matched the routing key, and exactly one channel ack. When a
//! return happens it is delivered before the ack for the same message, so a
//! returned message is parked in staging and the ack decides where it goes:
//!
//! | staged? | accepted | result                                   |
//! |---------|----------|------------------------------------------|
//! | yes     | any      | moved back to its bucket (needs resend)  |
//! | no      | true     | removed from its bucket (delivered)      |
//! | no      | false    | left in its bucket (needs resend)        |
//!
//! Publishes without a correlation context are never cached or retried.

use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use cg_cache::{CorrelationCache, StagedMessage};
use cg_common::{CachedMessage, CorrelationKey, MessageState, Result};

/// Result of processing an unroutable return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnroutableOutcome {
    /// Entry moved from its bucket into staging
    Staged,
    /// No entry in the bucket, nothing moved
    NothingToStage,
}

impl UnroutableOutcome {
    pub fn state(&self) -> Option<MessageState> {
        match self {
            UnroutableOutcome::Staged => Some(MessageState::Returned),
            UnroutableOutcome::NothingToStage => None,
        }
    }
}

/// Result of processing a channel ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Routed and accepted; `was_cached` tells whether an entry was removed
    Delivered { was_cached: bool },
    /// A return preceded the ack; the entry is back in its bucket
    Returned,
    /// Broker refused the publish; the entry stays where it was registered
    Nacked { cached: bool },
    /// Published without correlation context, nothing to reconcile
    Untracked,
}

impl AckOutcome {
    pub fn needs_resend(&self) -> bool {
        matches!(self, AckOutcome::Returned | AckOutcome::Nacked { .. })
    }

    pub fn state(&self) -> Option<MessageState> {
        match self {
            AckOutcome::Delivered { .. } => Some(MessageState::Delivered),
            AckOutcome::Returned | AckOutcome::Nacked { .. } => Some(MessageState::NeedsResend),
            AckOutcome::Untracked => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Delivered { .. } => "delivered",
            AckOutcome::Returned => "returned",
            AckOutcome::Nacked { .. } => "nacked",
            AckOutcome::Untracked => "untracked",
        }
    }
}

/// Broker feedback for one publish, as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Unroutable {
        key: CorrelationKey,
    },
    ChannelAck {
        context: Option<CorrelationKey>,
        accepted: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Unroutable(UnroutableOutcome),
    Ack(AckOutcome),
}

/// Drives correlation cache transitions from broker feedback.
///
/// Safe to call concurrently for different ids. For a single id callers must
/// deliver the return (if any) before the ack, which AMQP guarantees.
pub struct AckReconciler {
    cache: Arc<CorrelationCache>,

    /// Ids released from staging by a sweep whose ack has not arrived yet
    swept: DashMap<String, Instant>,
}

impl AckReconciler {
    pub fn new(cache: Arc<CorrelationCache>) -> Self {
        Self {
            cache,
            swept: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }

    /// Register a message as pending before it is published
    pub fn on_publish(&self, key: &CorrelationKey, message: CachedMessage) -> Result<()> {
        self.cache.put(&key.bucket, &key.id, message)?;
        // A resend of a swept message starts a new lifecycle under the same id
        if self.swept.remove(&key.id).is_some() {
            debug!(message_id = %key.id, "Cleared sweep marker for republished message");
        }
        metrics::counter!("confirmguard_published_total").increment(1);
        debug!(bucket = %key.bucket, message_id = %key.id, "Message registered as pending");
        Ok(())
    }

    /// Handle a return for a message that matched no queue
    pub fn on_unroutable(&self, key: &CorrelationKey) -> UnroutableOutcome {
        if key.is_staging() {
            warn!(message_id = %key.id, "Unroutable return references the staging namespace, ignoring");
            return UnroutableOutcome::NothingToStage;
        }
        metrics::counter!("confirmguard_unroutable_total").increment(1);

        match self.cache.remove(&key.bucket, &key.id) {
            Some(message) => {
                self.cache.stage(&key.id, StagedMessage::new(key.bucket.clone(), message));
                debug!(bucket = %key.bucket, message_id = %key.id, "Unroutable message moved to staging");
                UnroutableOutcome::Staged
            }
            None => {
                debug!(
                    bucket = %key.bucket,
                    message_id = %key.id,
                    "Unroutable message has no cache entry, nothing to stage"
                );
                UnroutableOutcome::NothingToStage
            }
        }
    }

    /// Handle the channel ack for a publish
    pub fn on_channel_ack(&self, context: Option<&CorrelationKey>, accepted: bool) -> AckOutcome {
        let outcome = self.reconcile_ack(context, accepted);
        metrics::counter!("confirmguard_acks_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    fn reconcile_ack(&self, context: Option<&CorrelationKey>, accepted: bool) -> AckOutcome {
        let Some(key) = context else {
            info!(accepted, "Message published without correlation context, it will not be retried");
            return AckOutcome::Untracked;
        };

        if key.is_staging() || key.bucket.is_empty() || key.id.is_empty() {
            warn!(key = %key, "Channel ack carries an unusable correlation context, ignoring");
            return AckOutcome::Untracked;
        }

        if let Some(staged) = self.cache.unstage(&key.id) {
            if staged.bucket != key.bucket {
                warn!(
                    message_id = %key.id,
                    staged_bucket = %staged.bucket,
                    ack_bucket = %key.bucket,
                    "Staged bucket differs from ack bucket, restoring to ack bucket"
                );
            }
            self.restore(&key.bucket, &key.id, staged.message);
            debug!(bucket = %key.bucket, message_id = %key.id, accepted, "Returned message queued for resend");
            return AckOutcome::Returned;
        }

        if self.swept.remove(&key.id).is_some() {
            debug!(bucket = %key.bucket, message_id = %key.id, "Ack for a message already released by the staging sweep");
            return AckOutcome::Returned;
        }

        if accepted {
            let was_cached = self.cache.remove(&key.bucket, &key.id).is_some();
            debug!(bucket = %key.bucket, message_id = %key.id, was_cached, "Message delivered");
            AckOutcome::Delivered { was_cached }
        } else {
            let cached = self.cache.contains(&key.bucket, &key.id);
            info!(bucket = %key.bucket, message_id = %key.id, cached, "Message not accepted by the broker");
            AckOutcome::Nacked { cached }
        }
    }

    fn restore(&self, bucket: &str, id: &str, message: CachedMessage) {
        if let Err(e) = self.cache.put(bucket, id, message) {
            error!(bucket = %bucket, message_id = %id, error = %e, "Failed to restore message to its bucket");
        }
    }

    /// Dispatch a broker event to the matching handler
    pub fn handle(&self, event: BrokerEvent) -> EventOutcome {
        match event {
            BrokerEvent::Unroutable { key } => EventOutcome::Unroutable(self.on_unroutable(&key)),
            BrokerEvent::ChannelAck { context, accepted } => {
                EventOutcome::Ack(self.on_channel_ack(context.as_ref(), accepted))
            }
        }
    }

    /// Release staging entries older than `max_age` back to their buckets.
    ///
    /// A returned message was never routed, so it needs a resend whatever the
    /// ack would have said. Released ids are remembered for `max_age` so a
    /// late ack does not delete the restored entry.
    pub fn sweep_staging(&self, max_age: Duration) -> Vec<CorrelationKey> {
        self.swept.retain(|_, released_at| released_at.elapsed() < max_age);

        let mut released = Vec::new();
        for id in self.cache.stale_staged(max_age) {
            // Mark before taking the entry so a concurrent ack never sees
            // neither staging nor the marker
            self.swept.insert(id.clone(), Instant::now());

            match self.cache.unstage(&id) {
                Some(staged) => {
                    warn!(
                        bucket = %staged.bucket,
                        message_id = %id,
                        staged_secs = staged.age().as_secs(),
                        "Staged message never received an ack, releasing for resend"
                    );
                    self.restore(&staged.bucket, &id, staged.message);
                    released.push(CorrelationKey::new(staged.bucket, id));
                }
                None => {
                    // The ack got there first
                    self.swept.remove(&id);
                }
            }
        }

        if !released.is_empty() {
            metrics::counter!("confirmguard_staging_swept_total").increment(released.len() as u64);
        }
        released
    }

    /// Ids currently remembered as released by a sweep
    pub fn swept_len(&self) -> usize {
        self.swept.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_common::STAGING_NAMESPACE;

    fn setup() -> (Arc<CorrelationCache>, AckReconciler) {
        let cache = Arc::new(CorrelationCache::new());
        let reconciler = AckReconciler::new(cache.clone());
        (cache, reconciler)
    }

    fn message(id: &str) -> CachedMessage {
        CachedMessage::new(id, "business", "order.save", bytes::Bytes::from(format!("body-{}", id)))
    }

    #[test]
    fn test_happy_path_delivered() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m1");
        reconciler.on_publish(&key, message("m1")).unwrap();

        let outcome = reconciler.on_channel_ack(Some(&key), true);

        assert_eq!(outcome, AckOutcome::Delivered { was_cached: true });
        assert_eq!(outcome.state(), Some(MessageState::Delivered));
        assert!(!cache.contains("orders", "m1"));
        assert_eq!(cache.staging_len(), 0);
    }

    #[test]
    fn test_unroutable_then_ack_true_needs_resend() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m2");
        let original = message("m2");
        reconciler.on_publish(&key, original.clone()).unwrap();

        assert_eq!(reconciler.on_unroutable(&key), UnroutableOutcome::Staged);
        assert!(!cache.contains("orders", "m2"));
        assert!(cache.contains(STAGING_NAMESPACE, "m2"));

        let outcome = reconciler.on_channel_ack(Some(&key), true);

        assert_eq!(outcome, AckOutcome::Returned);
        assert!(outcome.needs_resend());
        assert!(!cache.contains(STAGING_NAMESPACE, "m2"));
        assert_eq!(cache.get("orders", "m2"), Some(original));
    }

    #[test]
    fn test_unroutable_then_ack_false_needs_resend() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m2");
        let original = message("m2");
        reconciler.on_publish(&key, original.clone()).unwrap();

        reconciler.on_unroutable(&key);
        let outcome = reconciler.on_channel_ack(Some(&key), false);

        assert_eq!(outcome, AckOutcome::Returned);
        assert!(!cache.contains(STAGING_NAMESPACE, "m2"));
        assert_eq!(cache.get("orders", "m2"), Some(original));
    }

    #[test]
    fn test_nack_without_return_leaves_entry() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m3");
        let original = message("m3");
        reconciler.on_publish(&key, original.clone()).unwrap();

        let outcome = reconciler.on_channel_ack(Some(&key), false);

        assert_eq!(outcome, AckOutcome::Nacked { cached: true });
        assert_eq!(outcome.state(), Some(MessageState::NeedsResend));
        assert_eq!(cache.get("orders", "m3"), Some(original));
        assert_eq!(cache.bucket_len("orders"), 1);
    }

    #[test]
    fn test_opt_out_touches_nothing() {
        let (cache, reconciler) = setup();
        let unregistered = CorrelationKey::new("orders", "ghost");

        assert_eq!(reconciler.on_unroutable(&unregistered), UnroutableOutcome::NothingToStage);
        assert_eq!(reconciler.on_channel_ack(None, true), AckOutcome::Untracked);
        assert_eq!(reconciler.on_channel_ack(None, false), AckOutcome::Untracked);
        assert_eq!(
            reconciler.on_channel_ack(Some(&unregistered), true),
            AckOutcome::Delivered { was_cached: false }
        );
        assert_eq!(
            reconciler.on_channel_ack(Some(&unregistered), false),
            AckOutcome::Nacked { cached: false }
        );

        assert_eq!(cache.pending_total(), 0);
        assert_eq!(cache.staging_len(), 0);
    }

    #[test]
    fn test_duplicate_unroutable_is_noop() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m4");
        reconciler.on_publish(&key, message("m4")).unwrap();

        assert_eq!(reconciler.on_unroutable(&key), UnroutableOutcome::Staged);
        assert_eq!(reconciler.on_unroutable(&key), UnroutableOutcome::NothingToStage);
        assert_eq!(cache.staging_len(), 1);
        assert!(!cache.contains("orders", "m4"));
    }

    #[test]
    fn test_duplicate_ack_after_return_keeps_single_entry() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m5");
        reconciler.on_publish(&key, message("m5")).unwrap();
        reconciler.on_unroutable(&key);

        assert_eq!(reconciler.on_channel_ack(Some(&key), false), AckOutcome::Returned);
        assert_eq!(reconciler.on_channel_ack(Some(&key), false), AckOutcome::Nacked { cached: true });
        assert_eq!(cache.bucket_len("orders"), 1);
    }

    #[test]
    fn test_ack_restores_to_ack_bucket() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m6");
        reconciler.on_publish(&key, message("m6")).unwrap();
        reconciler.on_unroutable(&key);

        let other = CorrelationKey::new("orders-retry", "m6");
        assert_eq!(reconciler.on_channel_ack(Some(&other), true), AckOutcome::Returned);
        assert!(cache.contains("orders-retry", "m6"));
        assert!(!cache.contains("orders", "m6"));
    }

    #[test]
    fn test_staging_context_is_rejected() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new(STAGING_NAMESPACE, "m7");

        assert!(reconciler.on_publish(&key, message("m7")).is_err());
        assert_eq!(reconciler.on_unroutable(&key), UnroutableOutcome::NothingToStage);
        assert_eq!(reconciler.on_channel_ack(Some(&key), true), AckOutcome::Untracked);
        assert_eq!(cache.staging_len(), 0);
    }

    #[test]
    fn test_handle_dispatches_events() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m8");
        reconciler.on_publish(&key, message("m8")).unwrap();

        let first = reconciler.handle(BrokerEvent::Unroutable { key: key.clone() });
        let second = reconciler.handle(BrokerEvent::ChannelAck {
            context: Some(key.clone()),
            accepted: true,
        });

        assert_eq!(first, EventOutcome::Unroutable(UnroutableOutcome::Staged));
        assert_eq!(second, EventOutcome::Ack(AckOutcome::Returned));
        assert!(cache.contains("orders", "m8"));
    }

    #[test]
    fn test_sweep_releases_stale_staging() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m9");
        reconciler.on_publish(&key, message("m9")).unwrap();
        reconciler.on_unroutable(&key);

        assert!(reconciler.sweep_staging(Duration::from_secs(3600)).is_empty());
        assert_eq!(cache.staging_len(), 1);

        let released = reconciler.sweep_staging(Duration::ZERO);
        assert_eq!(released, vec![key.clone()]);
        assert_eq!(cache.staging_len(), 0);
        assert!(cache.contains("orders", "m9"));
        assert_eq!(reconciler.swept_len(), 1);

        // A late ack must not delete the released entry
        assert_eq!(reconciler.on_channel_ack(Some(&key), true), AckOutcome::Returned);
        assert!(cache.contains("orders", "m9"));
        assert_eq!(reconciler.swept_len(), 0);
    }

    #[test]
    fn test_republish_after_sweep_is_delivered() {
        let (cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m11");
        reconciler.on_publish(&key, message("m11")).unwrap();
        reconciler.on_unroutable(&key);
        reconciler.sweep_staging(Duration::ZERO);
        assert_eq!(reconciler.swept_len(), 1);

        // Resend job publishes the released message again and it routes
        let resend = cache.get("orders", "m11").unwrap();
        reconciler.on_publish(&key, resend).unwrap();
        assert_eq!(reconciler.swept_len(), 0);

        assert_eq!(
            reconciler.on_channel_ack(Some(&key), true),
            AckOutcome::Delivered { was_cached: true }
        );
        assert_eq!(cache.bucket_len("orders"), 0);
        assert_eq!(cache.staging_len(), 0);
    }

    #[test]
    fn test_sweep_forgets_old_markers() {
        let (_cache, reconciler) = setup();
        let key = CorrelationKey::new("orders", "m10");
        reconciler.on_publish(&key, message("m10")).unwrap();
        reconciler.on_unroutable(&key);

        reconciler.sweep_staging(Duration::ZERO);
        assert_eq!(reconciler.swept_len(), 1);

        // Nothing staged any more and the marker is older than zero
        reconciler.sweep_staging(Duration::ZERO);
        assert_eq!(reconciler.swept_len(), 0);
    }
}
