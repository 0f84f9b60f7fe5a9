use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Error type for queue, topology and broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection or channel level failure. The in-flight operation is abandoned
    /// and the caller is expected to reconnect.
    #[error("RabbitMQ transport error: {0}")]
    Transport(String),

    /// The broker refused a declaration because an entity with the same name
    /// already exists with different parameters.
    #[error("declaration conflict: {message}")]
    DeclarationConflict { message: String },

    /// A delay that cannot be turned into a non-negative number of whole seconds.
    #[error("invalid delay: {0}")]
    InvalidDelay(String),

    /// Invalid or unloadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Job payload could not be encoded or decoded.
    #[error("failed to (de)serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Returns true when the error came from the connection rather than from
    /// the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, QueueError::Transport(_))
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(ref amqp)
                if matches!(
                    amqp.kind(),
                    AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                ) =>
            {
                QueueError::DeclarationConflict {
                    message: amqp.get_message().as_str().to_string(),
                }
            }
            other => QueueError::Transport(other.to_string()),
        }
    }
}

impl From<::config::ConfigError> for QueueError {
    fn from(err: ::config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}
