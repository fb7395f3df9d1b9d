//! Settling deliveries whose processing failed
//!
//! Fatal failures are acked and dropped so they never come back; everything
//! else is nacked with requeue and follows the queue's normal redelivery and
//! dead-letter path.

use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tracing::{error, warn};

use cg_common::{ConfirmGuardError, Result};
use cg_reconciler::{FailureCause, FailureDisposition, FatalOutcomeClassifier};

pub struct ConsumerErrorHandler {
    classifier: FatalOutcomeClassifier,
}

impl ConsumerErrorHandler {
    pub fn new(classifier: FatalOutcomeClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &FatalOutcomeClassifier {
        &self.classifier
    }

    /// Settle a failed delivery and return what was done with it
    pub async fn handle_failure(&self, delivery: &Delivery, cause: &FailureCause) -> Result<FailureDisposition> {
        let routing_key = delivery.routing_key.as_str();
        let disposition = self.classifier.disposition(routing_key, cause);
        settle(&delivery.acker, disposition).await?;

        match disposition {
            FailureDisposition::Discard => error!(
                routing_key = %routing_key,
                delivery_tag = delivery.delivery_tag,
                cause = %cause,
                "Fatal consumer failure, message discarded"
            ),
            FailureDisposition::Requeue => warn!(
                routing_key = %routing_key,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                cause = %cause,
                "Consumer failure, message requeued"
            ),
        }
        Ok(disposition)
    }
}

/// How a failed delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq)]
enum Settlement {
    Ack(BasicAckOptions),
    Nack(BasicNackOptions),
}

fn settlement_for(disposition: FailureDisposition) -> Settlement {
    match disposition {
        FailureDisposition::Discard => Settlement::Ack(BasicAckOptions::default()),
        FailureDisposition::Requeue => Settlement::Nack(BasicNackOptions {
            requeue: true,
            ..Default::default()
        }),
    }
}

async fn settle(acker: &Acker, disposition: FailureDisposition) -> Result<()> {
    let settled = match settlement_for(disposition) {
        Settlement::Ack(options) => acker.ack(options).await,
        Settlement::Nack(options) => acker.nack(options).await,
    };
    settled.map_err(|e| ConfirmGuardError::Transport(format!("failed to settle delivery: {}", e)))
}
