//! AmqpTransport - RabbitMQ publishing via lapin
//!
//! The channel is put in confirm mode and every publish is `mandatory`, so
//! the broker returns messages that match no binding. lapin attaches a return
//! to the confirmation it precedes, which preserves the return-before-ack
//! order the reconciler relies on.

use async_trait::async_trait;
use lapin::message::BasicReturnMessage;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use cg_common::{CachedMessage, ConfirmGuardError, Result};
use cg_reconciler::{BrokerTransport, Confirmation, ReturnedMessage};

const PERSISTENT_DELIVERY: u8 = 2;

fn transport_error(context: &str, e: lapin::Error) -> ConfirmGuardError {
    ConfirmGuardError::Transport(format!("{}: {}", context, e))
}

pub struct AmqpTransport {
    channel: Channel,
    /// Held so the connection outlives the channel when we opened it
    _connection: Option<Connection>,
}

impl AmqpTransport {
    /// Wrap an existing channel, switching it to confirm mode
    pub async fn new(channel: Channel) -> Result<Self> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| transport_error("confirm_select failed", e))?;
        debug!(channel_id = channel.id(), "Publisher confirms enabled");

        Ok(Self {
            channel,
            _connection: None,
        })
    }

    /// Open a connection and a confirm-mode channel
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| transport_error("connection failed", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| transport_error("channel creation failed", e))?;
        info!(channel_id = channel.id(), "Connected to AMQP broker");

        let mut transport = Self::new(channel).await?;
        transport._connection = Some(connection);
        Ok(transport)
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

pub(crate) fn publish_options() -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: true,
        ..Default::default()
    }
}

pub(crate) fn publish_properties(message: &CachedMessage) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(message.id.clone()))
        .with_delivery_mode(PERSISTENT_DELIVERY)
        .with_timestamp(message.created_at.timestamp().max(0) as u64);
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    properties
}

fn returned_message(returned: &BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage {
        reply_code: returned.reply_code,
        reply_text: returned.reply_text.as_str().to_string(),
        exchange: returned.delivery.exchange.as_str().to_string(),
        routing_key: returned.delivery.routing_key.as_str().to_string(),
    }
}

pub(crate) fn map_confirmation(confirmation: LapinConfirmation) -> Result<Confirmation> {
    match confirmation {
        LapinConfirmation::Ack(returned) => Ok(Confirmation::Ack {
            returned: returned.as_deref().map(returned_message),
        }),
        LapinConfirmation::Nack(returned) => Ok(Confirmation::Nack {
            returned: returned.as_deref().map(returned_message),
        }),
        LapinConfirmation::NotRequested => Err(ConfirmGuardError::Transport(
            "publisher confirms are not enabled on the channel".to_string(),
        )),
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn publish(&self, message: &CachedMessage) -> Result<Confirmation> {
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                publish_options(),
                &message.payload,
                publish_properties(message),
            )
            .await
            .map_err(|e| transport_error("basic_publish failed", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| transport_error("awaiting confirmation failed", e))?;
        debug!(
            message_id = %message.id,
            routing_key = %message.routing_key,
            ?confirmation,
            "Publish confirmed"
        );

        map_confirmation(confirmation)
    }
}
