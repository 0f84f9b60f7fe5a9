//! Queue/exchange declaration and the per-channel record of what has already
//! been declared.

use crate::broker::{BrokerChannel, DeadLetterArgs};
use crate::config::QueueConfig;
use crate::delay::{delayed_queue_name, ttl_millis};
use crate::error::{QueueError, Result};
use std::collections::HashSet;

/// Names declared on one channel. Append-only; a new channel starts empty.
#[derive(Debug, Default, Clone)]
pub struct TopologyCache {
    queues: HashSet<String>,
    delayed_queues: HashSet<String>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains(name)
    }

    pub fn has_delayed_queue(&self, name: &str) -> bool {
        self.delayed_queues.contains(name)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn delayed_queue_count(&self) -> usize {
        self.delayed_queues.len()
    }

    fn record_queue(&mut self, name: &str) {
        self.queues.insert(name.to_string());
    }

    fn record_delayed_queue(&mut self, name: &str) {
        self.delayed_queues.insert(name.to_string());
    }
}

/// Declares queue `name`, an exchange of the same name, and binds them with
/// `name` as the routing key. A name is only recorded once every call has
/// succeeded, so a failed declaration is attempted again next time.
pub(crate) async fn declare_queue<C>(
    channel: &C,
    cache: &mut TopologyCache,
    config: &QueueConfig,
    name: &str,
) -> Result<()>
where
    C: BrokerChannel + ?Sized,
{
    if cache.has_queue(name) {
        return Ok(());
    }

    channel.queue_declare(name, &config.queue_params, None).await?;
    channel.exchange_declare(name, &config.exchange_params).await?;
    channel.queue_bind(name, name, name).await?;

    cache.record_queue(name);
    log::debug!("Queue '{}' declared and bound to its exchange", name);
    Ok(())
}

/// Declares the holding queue for messages bound for `destination` after
/// `seconds`. Its messages expire after the delay and are dead-lettered to the
/// `destination` exchange with `destination` as routing key.
pub(crate) async fn declare_delayed_queue<C>(
    channel: &C,
    cache: &mut TopologyCache,
    config: &QueueConfig,
    destination: &str,
    seconds: u64,
) -> Result<String>
where
    C: BrokerChannel + ?Sized,
{
    if seconds == 0 {
        return Err(QueueError::InvalidDelay(
            "a holding queue needs a delay of at least one second".into(),
        ));
    }

    let name = delayed_queue_name(destination, seconds);
    if cache.has_delayed_queue(&name) {
        return Ok(name);
    }

    let dead_letter = DeadLetterArgs {
        exchange: destination.to_string(),
        routing_key: destination.to_string(),
        message_ttl_ms: ttl_millis(seconds)?,
    };

    channel.exchange_declare(&name, &config.exchange_params).await?;
    channel
        .queue_declare(&name, &config.queue_params, Some(&dead_letter))
        .await?;
    channel.queue_bind(&name, &name, &name).await?;

    cache.record_delayed_queue(&name);
    log::debug!(
        "Holding queue '{}' declared, dead-lettering to '{}' after {}s",
        name,
        destination,
        seconds
    );
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeParams, ExchangeType, QueueParams};
    use crate::memory::{BrokerCall, InMemoryBroker};

    fn config() -> QueueConfig {
        QueueConfig::new(
            "default",
            QueueParams { passive: false, durable: true, exclusive: false, auto_delete: false },
            ExchangeParams {
                kind: ExchangeType::Direct,
                passive: false,
                durable: true,
                auto_delete: false,
            },
        )
    }

    #[tokio::test]
    async fn test_queue_is_declared_once_per_cache() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();
        let mut cache = TopologyCache::new();

        declare_queue(&channel, &mut cache, &config(), "orders").await.unwrap();
        assert_eq!(
            broker.calls(),
            vec![
                BrokerCall::QueueDeclare { name: "orders".into(), dead_letter: None },
                BrokerCall::ExchangeDeclare { name: "orders".into() },
                BrokerCall::QueueBind {
                    queue: "orders".into(),
                    exchange: "orders".into(),
                    routing_key: "orders".into(),
                },
            ]
        );

        broker.clear_calls();
        declare_queue(&channel, &mut cache, &config(), "orders").await.unwrap();
        assert!(broker.calls().is_empty());
        assert!(cache.has_queue("orders"));
        assert_eq!(cache.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_declares_again() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();

        declare_queue(&channel, &mut TopologyCache::new(), &config(), "orders").await.unwrap();
        broker.clear_calls();
        declare_queue(&channel, &mut TopologyCache::new(), &config(), "orders").await.unwrap();

        assert_eq!(broker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_delayed_queue_carries_dead_letter_arguments() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();
        let mut cache = TopologyCache::new();

        let name = declare_delayed_queue(&channel, &mut cache, &config(), "orders", 30)
            .await
            .unwrap();

        assert_eq!(name, "orders_deferred_30");
        assert_eq!(
            broker.calls(),
            vec![
                BrokerCall::ExchangeDeclare { name: "orders_deferred_30".into() },
                BrokerCall::QueueDeclare {
                    name: "orders_deferred_30".into(),
                    dead_letter: Some(DeadLetterArgs {
                        exchange: "orders".into(),
                        routing_key: "orders".into(),
                        message_ttl_ms: 30_000,
                    }),
                },
                BrokerCall::QueueBind {
                    queue: "orders_deferred_30".into(),
                    exchange: "orders_deferred_30".into(),
                    routing_key: "orders_deferred_30".into(),
                },
            ]
        );

        broker.clear_calls();
        let again = declare_delayed_queue(&channel, &mut cache, &config(), "orders", 30)
            .await
            .unwrap();
        assert_eq!(again, name);
        assert!(broker.calls().is_empty());
        assert_eq!(cache.delayed_queue_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_second_holding_queue_is_refused() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();
        let mut cache = TopologyCache::new();

        let result = declare_delayed_queue(&channel, &mut cache, &config(), "orders", 0).await;

        assert!(matches!(result, Err(QueueError::InvalidDelay(_))));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_declaration_is_not_recorded() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();
        let mut cache = TopologyCache::new();

        broker.disconnect();
        let result = declare_queue(&channel, &mut cache, &config(), "orders").await;
        assert!(matches!(result, Err(QueueError::Transport(_))));
        assert!(!cache.has_queue("orders"));

        broker.reconnect();
        declare_queue(&channel, &mut cache, &config(), "orders").await.unwrap();
        assert!(cache.has_queue("orders"));
    }
}
