//! ReliablePublisher - the publish-side entry point
//!
//! Registers a message in the correlation cache before the transport sees
//! it, then feeds the broker's feedback to the reconciler in protocol order:
//! the return (if any) first, the channel ack second.

use std::sync::Arc;
use async_trait::async_trait;
use tracing::{error, info};

use cg_common::{CachedMessage, CorrelationKey, Result};
use crate::reconciler::{AckOutcome, AckReconciler};

/// Details the broker sends back with an unroutable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Broker feedback for one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack { returned: Option<ReturnedMessage> },
    Nack { returned: Option<ReturnedMessage> },
}

impl Confirmation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Confirmation::Ack { .. })
    }

    pub fn returned(&self) -> Option<&ReturnedMessage> {
        match self {
            Confirmation::Ack { returned } | Confirmation::Nack { returned } => returned.as_ref(),
        }
    }
}

/// Publishes with mandatory routing and publisher confirms.
///
/// Implementations resolve once the broker has confirmed (or refused) the
/// publish, reporting any return that arrived before the confirmation.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn publish(&self, message: &CachedMessage) -> Result<Confirmation>;
}

pub struct ReliablePublisher {
    transport: Arc<dyn BrokerTransport>,
    reconciler: Arc<AckReconciler>,
}

impl ReliablePublisher {
    pub fn new(transport: Arc<dyn BrokerTransport>, reconciler: Arc<AckReconciler>) -> Self {
        Self {
            transport,
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &Arc<AckReconciler> {
        &self.reconciler
    }

    /// Publish with an optional correlation context.
    ///
    /// Without a context the message is never cached and never retried. A
    /// transport error leaves a registered message pending in its bucket,
    /// where the resend job will pick it up.
    pub async fn publish(
        &self,
        message: CachedMessage,
        context: Option<CorrelationKey>,
    ) -> Result<AckOutcome> {
        if let Some(key) = &context {
            self.reconciler.on_publish(key, message.clone())?;
        }

        let confirmation = match self.transport.publish(&message).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    routing_key = %message.routing_key,
                    tracked = context.is_some(),
                    error = %e,
                    "Publish failed before confirmation"
                );
                return Err(e);
            }
        };

        if let Some(returned) = confirmation.returned() {
            info!(
                message_id = %message.id,
                reply_code = returned.reply_code,
                reply_text = %returned.reply_text,
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                "No queue matched the message"
            );
            if let Some(key) = &context {
                self.reconciler.on_unroutable(key);
            }
        }

        Ok(self.reconciler.on_channel_ack(context.as_ref(), confirmation.is_accepted()))
    }

    /// Publish tracked in `bucket` under the message's own id
    pub async fn publish_tracked(
        &self,
        bucket: &str,
        message: CachedMessage,
    ) -> Result<(CorrelationKey, AckOutcome)> {
        let key = CorrelationKey::new(bucket, message.id.clone());
        let outcome = self.publish(message, Some(key.clone())).await?;
        Ok((key, outcome))
    }

    /// Publish without caching; the message is dropped if it does not arrive
    pub async fn publish_untracked(&self, message: CachedMessage) -> Result<AckOutcome> {
        self.publish(message, None).await
    }
}
