//! The seam between the queue and the AMQP session it talks through.

use crate::config::{ExchangeParams, QueueParams};
use crate::error::Result;
use async_trait::async_trait;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP `delivery-mode` value for messages the broker must persist.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Dead-letter arguments attached to a holding queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterArgs {
    /// `x-dead-letter-exchange`
    pub exchange: String,
    /// `x-dead-letter-routing-key`
    pub routing_key: String,
    /// `x-message-ttl`, in milliseconds.
    pub message_ttl_ms: u64,
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
}

impl OutgoingMessage {
    /// A persistent `application/json` message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }

    pub fn delivery_mode(&self) -> u8 {
        if self.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            1
        }
    }
}

/// A message fetched with `basic_get`, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// One AMQP channel's worth of broker primitives.
///
/// Every method is a single round trip. Implementations do not retry and do
/// not cache; redundant declarations are filtered out by the caller.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn queue_declare(
        &self,
        name: &str,
        params: &QueueParams,
        dead_letter: Option<&DeadLetterArgs>,
    ) -> Result<()>;

    async fn exchange_declare(&self, name: &str, params: &ExchangeParams) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<()>;

    /// Fetches at most one message without blocking, in manual-ack mode.
    async fn basic_get(&self, queue: &str) -> Result<Option<Envelope>>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}
