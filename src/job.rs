//! A fetched message and the payload envelope jobs are published in.

use crate::broker::{BrokerChannel, Envelope};
use crate::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

/// JSON body of every message published through `push`, `push_to_route` and
/// `later`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload<T> {
    /// Name the consumer dispatches on.
    pub job: String,
    pub data: T,
}

impl<T: Serialize> JobPayload<T> {
    pub fn new(job: impl Into<String>, data: T) -> Self {
        Self { job: job.into(), data }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One message fetched from `queue`, bound to the channel it came from.
///
/// The settlement methods take `self`, so a job is acknowledged, released or
/// deleted at most once.
pub struct RabbitMQJob<C: BrokerChannel> {
    channel: Arc<C>,
    queue: String,
    envelope: Envelope,
}

impl<C: BrokerChannel> RabbitMQJob<C> {
    pub(crate) fn new(channel: Arc<C>, queue: String, envelope: Envelope) -> Self {
        Self { channel, queue, envelope }
    }

    /// The message body exactly as published.
    pub fn payload(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.envelope.delivery_tag
    }

    pub fn is_redelivered(&self) -> bool {
        self.envelope.redelivered
    }

    pub fn content_type(&self) -> Option<&str> {
        self.envelope.content_type.as_deref()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Parses the body as a [`JobPayload`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<JobPayload<T>> {
        Ok(serde_json::from_slice(&self.envelope.body)?)
    }

    pub fn job_name(&self) -> Result<String> {
        Ok(self.decode::<serde_json::Value>()?.job)
    }

    /// Removes the message from the broker.
    pub async fn ack(self) -> Result<()> {
        self.channel.basic_ack(self.envelope.delivery_tag).await?;
        log::debug!("Job acknowledged. Queue: '{}', tag: {}", self.queue, self.envelope.delivery_tag);
        Ok(())
    }

    /// Rejects the message and puts it back on its queue.
    pub async fn release(self) -> Result<()> {
        self.channel.basic_reject(self.envelope.delivery_tag, true).await?;
        log::debug!("Job released. Queue: '{}', tag: {}", self.queue, self.envelope.delivery_tag);
        Ok(())
    }

    /// Rejects the message without requeueing it.
    pub async fn delete(self) -> Result<()> {
        self.channel.basic_reject(self.envelope.delivery_tag, false).await?;
        log::debug!("Job deleted. Queue: '{}', tag: {}", self.queue, self.envelope.delivery_tag);
        Ok(())
    }
}
