//! Opening a queue on a real broker.

use crate::config::Settings;
use crate::error::Result;
use crate::lapin_channel::LapinChannel;
use crate::queue::RabbitMQQueue;
use lapin::{Connection, ConnectionProperties};

/// Opens connections and hands out queues bound to a fresh channel.
pub struct RabbitMQConnector;

impl RabbitMQConnector {
    /// Connects to the broker described by `settings.connection` and returns a
    /// queue on a new channel. The queue owns the connection.
    pub async fn connect(settings: &Settings) -> Result<RabbitMQQueue<LapinChannel>> {
        settings.queue.validate()?;

        let connection_config = &settings.connection;
        log::info!(
            "Connecting to RabbitMQ at {}:{} (vhost '{}')...",
            connection_config.host,
            connection_config.port,
            connection_config.vhost
        );

        let connection =
            Connection::connect_uri(connection_config.amqp_uri(), ConnectionProperties::default())
                .await?;
        let channel = connection.create_channel().await?;
        log::info!(
            "RabbitMQ channel {} opened. Default queue: '{}'",
            channel.id(),
            settings.queue.default_queue
        );

        RabbitMQQueue::new(
            LapinChannel::with_connection(connection, channel),
            settings.queue.clone(),
        )
    }
}

impl RabbitMQQueue<LapinChannel> {
    /// Closes the underlying channel and connection.
    pub async fn close(&self) -> Result<()> {
        self.channel().close().await
    }
}
