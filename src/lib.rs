//! # RabbitMQ Queue
//! A RabbitMQ job queue with delayed delivery built from per-delay holding
//! queues that dead-letter back into their destination.

pub mod broker;
pub mod config;
pub mod connector;
pub mod delay;
pub mod error;
pub mod job;
pub mod lapin_channel;
pub mod memory;
pub mod queue;
pub mod topology;

// Re-export key components for easy access
pub use broker::{BrokerChannel, DeadLetterArgs, Envelope, OutgoingMessage};
pub use crate::config::{ConnectionConfig, ExchangeParams, ExchangeType, QueueConfig, QueueParams, Settings};
pub use connector::RabbitMQConnector;
pub use delay::{delayed_queue_name, Delay};
pub use error::{QueueError, Result};
pub use job::{JobPayload, RabbitMQJob};
pub use lapin_channel::LapinChannel;
pub use memory::{BrokerCall, InMemoryBroker, InMemoryChannel};
pub use queue::{PublishOptions, RabbitMQQueue};
pub use topology::TopologyCache;
