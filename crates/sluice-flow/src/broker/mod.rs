//! Message broker abstraction.
//!
//! This module provides:
//!
//! - [`BrokerChannel`]: Trait over the broker operations the orchestrator uses
//! - [`BrokerError`]: Failure taxonomy that separates connection-level
//!   failures (reconnect and retry) from operation-level ones (surface)
//! - [`memory::InMemoryBroker`]: In-memory broker for tests and local runs
//! - [`http::RabbitManagementChannel`]: RabbitMQ over its HTTP management API
//!
//! A channel is an owned object with an explicit lifecycle. Components receive
//! it through their constructors; there is no process-wide connection.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on exact routing-key match.
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Routes on routing-key patterns.
    Topic,
}

impl ExchangeKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

/// Errors raised by a broker channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The connection dropped or could not be established.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker closed the connection or is temporarily unavailable.
    #[error("closed by broker ({code}): {reason}")]
    ClosedByBroker {
        /// Broker reply code.
        code: u16,
        /// Broker reply text.
        reason: String,
    },

    /// The broker rejected the operation itself.
    #[error("channel error ({code}): {reason}")]
    Channel {
        /// Broker reply code.
        code: u16,
        /// Broker reply text.
        reason: String,
    },

    /// A mandatory publish matched no queue.
    #[error("message to exchange '{exchange}' with routing key '{routing_key}' was not routed")]
    Unroutable {
        /// Target exchange.
        exchange: String,
        /// Routing key used.
        routing_key: String,
    },

    /// The named queue or exchange does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },

    /// The transport failed in a way that says nothing about the broker.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Returns true for failures cured by reconnecting and retrying.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::ClosedByBroker { .. } | Self::Transport(_)
        )
    }

    /// Returns true if the failure means the target is already absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Operations the orchestrator performs on the broker.
///
/// All declarations are idempotent: declaring an existing exchange or queue
/// with the same arguments succeeds. [`publish`](Self::publish) is mandatory:
/// a message that matches no queue is reported as
/// [`BrokerError::Unroutable`] rather than dropped.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declares a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Binds `queue` to `exchange` for `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes a persistent message with mandatory routing.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Deletes a queue. Deleting a missing queue yields [`BrokerError::NotFound`].
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Drops the current connection and opens a new one.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    /// Closes the channel. Further operations fail with
    /// [`BrokerError::ConnectionClosed`] until [`reconnect`](Self::reconnect).
    async fn close(&self) -> Result<(), BrokerError>;
}
