//! In-memory broker for tests and local development.
//!
//! Models the parts of an AMQP broker the queue relies on: queue and exchange
//! declarations with parameter checks, exact-key routing over bindings,
//! manual acknowledgement, and per-queue message TTL with dead-lettering.
//! Exchange types only take part in redeclaration checks. Expiry is evaluated
//! lazily on every broker call against `tokio::time::Instant`, so paused-clock
//! tests can fast-forward delays.
//!
//! Every channel created from one [`InMemoryBroker`] shares its state, which is
//! how several producers or consumers on one broker are modelled. Calls are
//! only logged on brokers built with [`InMemoryBroker::with_call_log`].

use crate::broker::{BrokerChannel, DeadLetterArgs, Envelope, OutgoingMessage};
use crate::config::{ExchangeParams, QueueParams};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A broker call as observed by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    QueueDeclare { name: String, dead_letter: Option<DeadLetterArgs> },
    ExchangeDeclare { name: String },
    QueueBind { queue: String, exchange: String, routing_key: String },
    Publish { exchange: String, routing_key: String },
    Get { queue: String },
    Ack { delivery_tag: u64 },
    Reject { delivery_tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: OutgoingMessage,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct QueueState {
    params: QueueParams,
    dead_letter: Option<DeadLetterArgs>,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct ExchangeState {
    params: ExchangeParams,
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct BrokerState {
    connected: bool,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    record_calls: bool,
    calls: Vec<BrokerCall>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connected: true,
            queues: HashMap::new(),
            exchanges: HashMap::new(),
            unacked: HashMap::new(),
            next_delivery_tag: 1,
            record_calls: false,
            calls: Vec::new(),
        }
    }
}

fn not_found(kind: &str, name: &str) -> QueueError {
    QueueError::Transport(format!("NOT_FOUND - no {} '{}'", kind, name))
}

impl BrokerState {
    /// Entry point of every channel operation.
    fn begin(&mut self, call: BrokerCall) -> Result<()> {
        if !self.connected {
            return Err(QueueError::Transport("connection closed".into()));
        }
        if self.record_calls {
            self.calls.push(call);
        }
        self.expire_messages(Instant::now());
        Ok(())
    }

    /// Dead-letters every message that has outlived its queue's TTL, in the
    /// order the TTLs ran out. A dead-lettered message is enqueued as of its
    /// expiry instant, and each call moves a message at most one hop.
    fn expire_messages(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            let Some(dead_letter) = queue.dead_letter.as_ref() else {
                continue;
            };
            let ttl = Duration::from_millis(dead_letter.message_ttl_ms);
            while queue
                .messages
                .front()
                .is_some_and(|message| now.duration_since(message.enqueued_at) >= ttl)
            {
                if let Some(message) = queue.messages.pop_front() {
                    let deadline = message.enqueued_at + ttl;
                    expired.push((deadline, dead_letter.clone(), message));
                }
            }
        }
        expired.sort_by_key(|(deadline, _, _)| *deadline);

        for (deadline, dead_letter, stored) in expired {
            log::trace!(
                "Message expired, dead-lettering to '{}' with key '{}'",
                dead_letter.exchange,
                dead_letter.routing_key
            );
            self.route(&dead_letter.exchange, &dead_letter.routing_key, stored.message, deadline);
        }
    }

    /// Delivers `message` to every queue bound to `exchange` with exactly
    /// `routing_key`. The nameless default exchange routes straight to the
    /// queue named by the routing key. Unroutable messages are dropped.
    fn route(&mut self, exchange: &str, routing_key: &str, message: OutgoingMessage, now: Instant) {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            match self.exchanges.get(exchange) {
                Some(state) => state
                    .bindings
                    .iter()
                    .filter(|(_, binding_key)| binding_key == routing_key)
                    .map(|(queue, _)| queue.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    message: message.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    enqueued_at: now,
                });
            }
        }
    }
}

/// A broker living entirely in process memory.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that also records every channel call, for asserting on the
    /// exact declare/publish sequence.
    pub fn with_call_log() -> Self {
        let broker = Self::default();
        broker.lock().record_calls = true;
        broker
    }

    /// Opens a new channel on this broker.
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel { state: Arc::clone(&self.state) }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every channel call made so far, in order. Always empty unless the
    /// broker was built with [`InMemoryBroker::with_call_log`].
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Makes every subsequent channel call fail with a transport error.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Ready messages in `queue` after applying any due expiry, or `None` if
    /// the queue does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        let mut state = self.lock();
        state.expire_messages(Instant::now());
        state.queues.get(queue).map(|queue| queue.messages.len())
    }

    /// Messages fetched but neither acknowledged nor rejected yet.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}

/// A channel on an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn queue_declare(
        &self,
        name: &str,
        params: &QueueParams,
        dead_letter: Option<&DeadLetterArgs>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::QueueDeclare {
            name: name.to_string(),
            dead_letter: dead_letter.cloned(),
        })?;

        let existing = state
            .queues
            .get(name)
            .map(|queue| (queue.params, queue.dead_letter.clone()));

        match existing {
            Some(_) if params.passive => Ok(()),
            None if params.passive => Err(not_found("queue", name)),
            Some((existing_params, existing_dead_letter)) => {
                let same_flags = existing_params.durable == params.durable
                    && existing_params.exclusive == params.exclusive
                    && existing_params.auto_delete == params.auto_delete;
                if same_flags && existing_dead_letter.as_ref() == dead_letter {
                    Ok(())
                } else {
                    Err(QueueError::DeclarationConflict {
                        message: format!(
                            "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                            name
                        ),
                    })
                }
            }
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        params: *params,
                        dead_letter: dead_letter.cloned(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn exchange_declare(&self, name: &str, params: &ExchangeParams) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::ExchangeDeclare { name: name.to_string() })?;

        let existing = state.exchanges.get(name).map(|exchange| exchange.params.clone());

        match existing {
            Some(_) if params.passive => Ok(()),
            None if params.passive => Err(not_found("exchange", name)),
            Some(existing) => {
                if existing.kind == params.kind
                    && existing.durable == params.durable
                    && existing.auto_delete == params.auto_delete
                {
                    Ok(())
                } else {
                    Err(QueueError::DeclarationConflict {
                        message: format!(
                            "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                            name
                        ),
                    })
                }
            }
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState { params: params.clone(), bindings: Vec::new() },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })?;

        if !state.queues.contains_key(queue) {
            return Err(not_found("queue", queue));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })?;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }
        state.route(exchange, routing_key, message.clone(), Instant::now());
        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Envelope>> {
        let mut state = self.lock();
        state.begin(BrokerCall::Get { queue: queue.to_string() })?;

        let stored = match state.queues.get_mut(queue) {
            Some(queue_state) => queue_state.messages.pop_front(),
            None => return Err(not_found("queue", queue)),
        };
        let Some(stored) = stored else {
            return Ok(None);
        };

        let delivery_tag = state.next_delivery_tag;
        state.next_delivery_tag += 1;

        let envelope = Envelope {
            delivery_tag,
            body: stored.message.body.clone(),
            content_type: Some(stored.message.content_type.clone()),
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
            redelivered: stored.redelivered,
        };
        state
            .unacked
            .insert(delivery_tag, Unacked { queue: queue.to_string(), message: stored });
        Ok(Some(envelope))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::Ack { delivery_tag })?;

        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| QueueError::Transport(format!("unknown delivery tag {}", delivery_tag)))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        state.begin(BrokerCall::Reject { delivery_tag, requeue })?;

        let Unacked { queue, mut message } = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| QueueError::Transport(format!("unknown delivery tag {}", delivery_tag)))?;

        let dead_letter = match state.queues.get_mut(&queue) {
            Some(queue_state) if requeue => {
                message.redelivered = true;
                queue_state.messages.push_front(message);
                return Ok(());
            }
            Some(queue_state) => queue_state.dead_letter.clone(),
            None => None,
        };

        if let Some(dead_letter) = dead_letter {
            state.route(
                &dead_letter.exchange,
                &dead_letter.routing_key,
                message.message,
                Instant::now(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeType;

    fn queue_params() -> QueueParams {
        QueueParams { passive: false, durable: true, exclusive: false, auto_delete: false }
    }

    fn exchange_params(kind: ExchangeType) -> ExchangeParams {
        ExchangeParams { kind, passive: false, durable: true, auto_delete: false }
    }

    async fn bound_queue(channel: &InMemoryChannel, queue: &str, exchange: &str, key: &str) {
        channel.queue_declare(queue, &queue_params(), None).await.unwrap();
        channel.queue_bind(queue, exchange, key).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_routing_uses_exact_key() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel
            .exchange_declare("jobs", &exchange_params(ExchangeType::Direct))
            .await
            .unwrap();
        bound_queue(&channel, "jobs", "jobs", "jobs").await;
        bound_queue(&channel, "priority", "jobs", "priority").await;

        let message = OutgoingMessage::json(b"{}".to_vec());
        channel.basic_publish("jobs", "priority", &message).await.unwrap();
        channel.basic_publish("jobs", "unbound", &message).await.unwrap();

        assert_eq!(broker.queue_len("jobs"), Some(0));
        assert_eq!(broker.queue_len("priority"), Some(1));
    }

    #[tokio::test]
    async fn test_redeclaration_with_different_flags_conflicts() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel.queue_declare("jobs", &queue_params(), None).await.unwrap();
        channel.queue_declare("jobs", &queue_params(), None).await.unwrap();

        let transient = QueueParams { durable: false, ..queue_params() };
        let result = channel.queue_declare("jobs", &transient, None).await;
        assert!(matches!(result, Err(QueueError::DeclarationConflict { .. })));

        channel
            .exchange_declare("jobs", &exchange_params(ExchangeType::Direct))
            .await
            .unwrap();
        let result = channel
            .exchange_declare("jobs", &exchange_params(ExchangeType::Topic))
            .await;
        assert!(matches!(result, Err(QueueError::DeclarationConflict { .. })));
    }

    #[tokio::test]
    async fn test_passive_declare_requires_existing_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        let passive = QueueParams { passive: true, ..queue_params() };

        let result = channel.queue_declare("missing", &passive, None).await;
        assert!(matches!(result, Err(QueueError::Transport(_))));
        assert!(!broker.has_queue("missing"));

        channel.queue_declare("present", &queue_params(), None).await.unwrap();
        channel.queue_declare("present", &passive, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();

        let result = channel
            .basic_publish("nowhere", "nowhere", &OutgoingMessage::json(Vec::new()))
            .await;
        assert!(matches!(result, Err(QueueError::Transport(_))));
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers_first() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel.queue_declare("jobs", &queue_params(), None).await.unwrap();
        channel.basic_publish("", "jobs", &OutgoingMessage::json(b"1".to_vec())).await.unwrap();
        channel.basic_publish("", "jobs", &OutgoingMessage::json(b"2".to_vec())).await.unwrap();

        let first = channel.basic_get("jobs").await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count(), 1);
        channel.basic_reject(first.delivery_tag, true).await.unwrap();

        let again = channel.basic_get("jobs").await.unwrap().unwrap();
        assert_eq!(again.body, b"1");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);

        channel.basic_ack(again.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("jobs"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel
            .exchange_declare("jobs", &exchange_params(ExchangeType::Direct))
            .await
            .unwrap();
        bound_queue(&channel, "jobs", "jobs", "jobs").await;
        let dead_letter = DeadLetterArgs {
            exchange: "jobs".into(),
            routing_key: "jobs".into(),
            message_ttl_ms: 5_000,
        };
        channel
            .queue_declare("holding", &queue_params(), Some(&dead_letter))
            .await
            .unwrap();

        channel
            .basic_publish("", "holding", &OutgoingMessage::json(b"later".to_vec()))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(broker.queue_len("holding"), Some(1));
        assert_eq!(broker.queue_len("jobs"), Some(0));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(broker.queue_len("holding"), Some(0));
        assert_eq!(broker.queue_len("jobs"), Some(1));

        let envelope = channel.basic_get("jobs").await.unwrap().unwrap();
        assert_eq!(envelope.body, b"later");
        assert_eq!(envelope.exchange, "jobs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiries_in_one_tick_arrive_in_deadline_order() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel
            .exchange_declare("jobs", &exchange_params(ExchangeType::Direct))
            .await
            .unwrap();
        bound_queue(&channel, "jobs", "jobs", "jobs").await;

        let scheduled: [(u64, &str); 6] =
            [(20, "B"), (10, "A"), (15, "F"), (11, "C"), (14, "E"), (12, "D")];
        for (seconds, body) in scheduled {
            let holding = format!("holding_{}", seconds);
            let dead_letter = DeadLetterArgs {
                exchange: "jobs".into(),
                routing_key: "jobs".into(),
                message_ttl_ms: seconds * 1_000,
            };
            channel
                .queue_declare(&holding, &queue_params(), Some(&dead_letter))
                .await
                .unwrap();
            channel
                .basic_publish("", &holding, &OutgoingMessage::json(body.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(30)).await;

        let mut delivered = Vec::new();
        while let Some(envelope) = channel.basic_get("jobs").await.unwrap() {
            delivered.push(String::from_utf8(envelope.body).unwrap());
        }
        assert_eq!(delivered, ["A", "C", "D", "E", "F", "B"]);
    }

    #[tokio::test]
    async fn test_disconnected_broker_fails_every_call() {
        let broker = InMemoryBroker::with_call_log();
        let channel = broker.channel();
        broker.disconnect();

        let result = channel.basic_get("jobs").await;
        assert!(matches!(result, Err(QueueError::Transport(_))));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_call_log_is_opt_in() {
        let quiet = InMemoryBroker::new();
        let channel = quiet.channel();
        channel.queue_declare("jobs", &queue_params(), None).await.unwrap();
        channel.basic_publish("", "jobs", &OutgoingMessage::json(b"1".to_vec())).await.unwrap();
        assert!(quiet.calls().is_empty());

        let logged = InMemoryBroker::with_call_log();
        let channel = logged.channel();
        channel.queue_declare("jobs", &queue_params(), None).await.unwrap();
        channel.basic_publish("", "jobs", &OutgoingMessage::json(b"1".to_vec())).await.unwrap();
        assert_eq!(
            logged.calls(),
            vec![
                BrokerCall::QueueDeclare { name: "jobs".into(), dead_letter: None },
                BrokerCall::Publish { exchange: String::new(), routing_key: "jobs".into() },
            ]
        );

        logged.clear_calls();
        assert!(logged.calls().is_empty());
    }
}
