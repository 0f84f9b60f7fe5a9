//! [`BrokerChannel`] over a `lapin` channel.

use crate::broker::{BrokerChannel, DeadLetterArgs, Envelope, OutgoingMessage};
use crate::config::{ExchangeParams, ExchangeType, QueueParams};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ExchangeKind,
};

/// A `lapin` channel, optionally owning the connection it was opened on so the
/// connection lives exactly as long as the channel is in use.
pub struct LapinChannel {
    channel: Channel,
    connection: Option<Connection>,
}

impl LapinChannel {
    /// Wraps a channel whose connection is owned elsewhere.
    pub fn new(channel: Channel) -> Self {
        Self { channel, connection: None }
    }

    pub(crate) fn with_connection(connection: Connection, channel: Channel) -> Self {
        Self { channel, connection: Some(connection) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Closes the channel, then the owned connection if there is one.
    pub async fn close(&self) -> Result<()> {
        self.channel.close(200, "OK").await?;
        if let Some(connection) = &self.connection {
            connection.close(200, "OK").await?;
        }
        log::info!("RabbitMQ channel {} closed", self.channel.id());
        Ok(())
    }
}

fn exchange_kind(kind: &ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Custom(kind) => ExchangeKind::Custom(kind.clone()),
    }
}

fn dead_letter_table(args: &DeadLetterArgs) -> Result<FieldTable> {
    let ttl = i64::try_from(args.message_ttl_ms)
        .map_err(|_| QueueError::InvalidDelay(format!("TTL of {}ms is too large", args.message_ttl_ms)))?;

    let mut table = FieldTable::default();
    table.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(args.exchange.clone().into()),
    );
    table.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(args.routing_key.clone().into()),
    );
    table.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl));
    Ok(table)
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(
        &self,
        name: &str,
        params: &QueueParams,
        dead_letter: Option<&DeadLetterArgs>,
    ) -> Result<()> {
        let arguments = match dead_letter {
            Some(args) => dead_letter_table(args)?,
            None => FieldTable::default(),
        };

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: params.passive,
                    durable: params.durable,
                    exclusive: params.exclusive,
                    auto_delete: params.auto_delete,
                    nowait: false,
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, params: &ExchangeParams) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(&params.kind),
                ExchangeDeclareOptions {
                    passive: params.passive,
                    durable: params.durable,
                    auto_delete: params.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.clone().into())
            .with_delivery_mode(message.delivery_mode());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Envelope>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;

        Ok(message.map(|message| {
            let delivery = message.delivery;
            Envelope {
                delivery_tag: delivery.delivery_tag,
                content_type: delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|content_type| content_type.as_str().to_string()),
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                body: delivery.data,
            }
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
