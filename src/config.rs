//! Queue, exchange and connection configuration.
//!
//! Queue and exchange flags have no defaults: every declaration made by a
//! [`RabbitMQQueue`](crate::RabbitMQQueue) uses them verbatim, and all
//! producers and consumers sharing a topology must agree on them.

use crate::error::{QueueError, Result};
use ::config::{Config, Environment, File};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::fmt;

/// Flags applied to every queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueueParams {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Exchange type, as understood by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin-provided type such as `x-delayed-message`.
    Custom(String),
}

impl ExchangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
            ExchangeType::Custom(kind) => kind,
        }
    }
}

impl From<&str> for ExchangeType {
    fn from(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "direct" => ExchangeType::Direct,
            "fanout" => ExchangeType::Fanout,
            "topic" => ExchangeType::Topic,
            "headers" => ExchangeType::Headers,
            _ => ExchangeType::Custom(kind.to_string()),
        }
    }
}

impl From<String> for ExchangeType {
    fn from(kind: String) -> Self {
        ExchangeType::from(kind.as_str())
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags applied to every exchange declaration. The exchange name always
/// matches the queue it fronts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeParams {
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Everything a [`RabbitMQQueue`](crate::RabbitMQQueue) needs at construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Queue used whenever an operation is given no (or a blank) queue name.
    pub default_queue: String,
    pub queue_params: QueueParams,
    pub exchange_params: ExchangeParams,
}

impl QueueConfig {
    pub fn new(
        default_queue: impl Into<String>,
        queue_params: QueueParams,
        exchange_params: ExchangeParams,
    ) -> Self {
        Self {
            default_queue: default_queue.into(),
            queue_params,
            exchange_params,
        }
    }

    /// Rejects configurations that could never produce a valid queue name.
    pub fn validate(&self) -> Result<()> {
        if self.default_queue.trim().is_empty() {
            return Err(QueueError::Config("default queue name must not be empty".into()));
        }
        Ok(())
    }

    /// Returns `queue` unless it is absent or blank, in which case the default
    /// queue name is used.
    pub fn resolve_queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        match queue {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.default_queue,
        }
    }
}

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_login() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            login: default_login(),
            password: default_password(),
            vhost: default_vhost(),
        }
    }
}

impl ConnectionConfig {
    /// Creates a new `ConnectionConfigBuilder` starting from the defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// The broker address as a structured AMQP URI. Fields are carried over
    /// unescaped, so credentials, vhosts and IPv6 hosts need no encoding.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.login.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString::default(),
        }
    }
}

/// A builder for creating `ConnectionConfig` instances.
#[derive(Default)]
pub struct ConnectionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    login: Option<String>,
    password: Option<String>,
    vhost: Option<String>,
}

impl ConnectionConfigBuilder {
    /// Defaults to `localhost`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Defaults to 5672.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets login and password. Both default to `guest`.
    pub fn credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = Some(password.into());
        self
    }

    /// Defaults to `/`.
    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.unwrap_or_else(default_host),
            port: self.port.unwrap_or_else(default_port),
            login: self.login.unwrap_or_else(default_login),
            password: self.password.unwrap_or_else(default_password),
            vhost: self.vhost.unwrap_or_else(default_vhost),
        }
    }
}

/// Connection plus queue configuration, as loaded from file and environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
}

impl Settings {
    /// Loads settings from an optional `config/rabbitmq` file, overridden by
    /// `RABBITMQ_`-prefixed environment variables using `__` for nesting, e.g.
    /// `RABBITMQ_QUEUE__QUEUE_PARAMS__DURABLE=true`.
    pub fn load() -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name("config/rabbitmq").required(false))
            .add_source(
                Environment::with_prefix("RABBITMQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.queue.validate()?;
        Ok(settings)
    }
}
