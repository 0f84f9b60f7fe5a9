//! The job queue: publishing, delayed publishing and fetching over one channel.

use crate::broker::{BrokerChannel, OutgoingMessage};
use crate::config::QueueConfig;
use crate::delay::Delay;
use crate::error::Result;
use crate::job::{JobPayload, RabbitMQJob};
use crate::topology::{self, TopologyCache};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where a published message goes, beyond the queue it targets.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PublishOptions {
    /// Publish to the queue's exchange with the queue name as routing key.
    #[default]
    Default,
    /// Hold the message back for the given delay. A delay of zero whole
    /// seconds publishes immediately, exactly like `Default`.
    Delayed(Delay),
    /// Publish to the queue's exchange with an explicit routing key.
    RoutingKey(String),
}

/// A job queue bound to a single broker channel.
///
/// Each distinct queue name gets its own exchange of the same name, bound with
/// the name as routing key. Delayed jobs go through a holding queue per
/// `(queue, delay)` pair that dead-letters back into the queue once the delay
/// has elapsed. Declarations are remembered for the lifetime of this value, so
/// each one reaches the broker once.
///
/// All operations lock the declaration cache for their whole duration, so a
/// queue shared between tasks still issues declare-then-publish sequences one
/// at a time.
pub struct RabbitMQQueue<C: BrokerChannel> {
    channel: Arc<C>,
    config: QueueConfig,
    topology: Mutex<TopologyCache>,
}

impl<C: BrokerChannel> RabbitMQQueue<C> {
    /// Creates a queue over `channel` with an empty declaration cache.
    pub fn new(channel: C, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            channel: Arc::new(channel),
            config,
            topology: Mutex::new(TopologyCache::new()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The queue an operation given `queue` would use.
    pub fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        self.config.resolve_queue_name(queue)
    }

    /// A snapshot of what has been declared through this queue so far.
    pub async fn topology(&self) -> TopologyCache {
        self.topology.lock().await.clone()
    }

    /// Publishes job `job` with `data` to `queue`.
    pub async fn push<T>(&self, job: &str, data: &T, queue: Option<&str>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = JobPayload::new(job, data).to_bytes()?;
        self.push_raw(&payload, queue, PublishOptions::Default).await
    }

    /// Publishes job `job` to `queue`'s exchange with `routing_key` instead of
    /// the queue name.
    pub async fn push_to_route<T>(
        &self,
        job: &str,
        data: &T,
        queue: &str,
        routing_key: &str,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = JobPayload::new(job, data).to_bytes()?;
        self.push_raw(
            &payload,
            Some(queue),
            PublishOptions::RoutingKey(routing_key.to_string()),
        )
        .await
    }

    /// Publishes job `job` so that it only becomes visible on `queue` after
    /// `delay`.
    pub async fn later<T>(&self, delay: Delay, job: &str, data: &T, queue: Option<&str>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = JobPayload::new(job, data).to_bytes()?;
        self.push_raw(&payload, queue, PublishOptions::Delayed(delay)).await
    }

    /// Publishes `payload` as a persistent `application/json` message.
    pub async fn push_raw(
        &self,
        payload: &[u8],
        queue: Option<&str>,
        options: PublishOptions,
    ) -> Result<()> {
        let queue = self.config.resolve_queue_name(queue);

        // Normalise before touching the broker so a bad delay declares nothing.
        let delay_seconds = match &options {
            PublishOptions::Delayed(delay) => delay.whole_seconds()?,
            _ => 0,
        };

        let mut cache = self.topology.lock().await;
        topology::declare_queue(&*self.channel, &mut cache, &self.config, queue).await?;

        let (exchange, routing_key) = match options {
            PublishOptions::Delayed(_) if delay_seconds > 0 => {
                let holding_queue = topology::declare_delayed_queue(
                    &*self.channel,
                    &mut cache,
                    &self.config,
                    queue,
                    delay_seconds,
                )
                .await?;
                (holding_queue.clone(), holding_queue)
            }
            PublishOptions::RoutingKey(routing_key) => (queue.to_string(), routing_key),
            PublishOptions::Delayed(_) | PublishOptions::Default => {
                (queue.to_string(), queue.to_string())
            }
        };

        let message = OutgoingMessage::json(payload.to_vec());
        self.channel
            .basic_publish(&exchange, &routing_key, &message)
            .await?;

        log::debug!(
            "Published {} bytes to exchange '{}' with routing key '{}'",
            payload.len(),
            exchange,
            routing_key
        );
        Ok(())
    }

    /// Fetches the next job from `queue`, if there is one. An empty queue is
    /// `Ok(None)`.
    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<RabbitMQJob<C>>> {
        let queue = self.config.resolve_queue_name(queue);

        let mut cache = self.topology.lock().await;
        topology::declare_queue(&*self.channel, &mut cache, &self.config, queue).await?;

        let envelope = self.channel.basic_get(queue).await?;
        Ok(envelope.map(|envelope| {
            log::debug!("Fetched job from '{}' with tag {}", queue, envelope.delivery_tag);
            RabbitMQJob::new(Arc::clone(&self.channel), queue.to_string(), envelope)
        }))
    }

    /// Declares `name` (or the default queue) and its exchange and binding,
    /// unless this queue has already done so. Returns the resolved name.
    pub async fn declare_queue(&self, name: Option<&str>) -> Result<String> {
        let name = self.config.resolve_queue_name(name);

        let mut cache = self.topology.lock().await;
        topology::declare_queue(&*self.channel, &mut cache, &self.config, name).await?;
        Ok(name.to_string())
    }

    /// Declares the holding queue that delivers into `destination` (or the
    /// default queue) after `delay`, and returns its name.
    ///
    /// Unlike `later`, a delay of zero seconds is an error here: there is no
    /// holding queue for "now".
    pub async fn declare_delayed_queue(&self, destination: Option<&str>, delay: Delay) -> Result<String> {
        let seconds = delay.whole_seconds()?;
        let destination = self.config.resolve_queue_name(destination);

        let mut cache = self.topology.lock().await;
        topology::declare_delayed_queue(&*self.channel, &mut cache, &self.config, destination, seconds)
            .await
    }
}
