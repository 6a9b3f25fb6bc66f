//! Broker collaborator interfaces
//!
//! The container never speaks a wire protocol itself. It consumes a broker
//! through these traits:
//!
//! - [`ConnectionProvider`] hands out a fresh [`Connection`] on demand
//! - [`Connection`] registers a [`MessageSink`] for channels and patterns and
//!   drives delivery from [`Connection::listen`]
//! - [`Subscription`] is the handle of an active subscription, used for
//!   incremental changes and for unsubscribing during shutdown
//!
//! Blocking clients stay inside `listen()` until the connection is closed or
//! every subscription is gone. Clients that deliver on their own threads return
//! from `listen()` immediately and keep `is_subscribed()` true.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::ConnectionResult;

/// An inbound message as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published to
    pub channel: String,
    /// Message body
    pub payload: Bytes,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Callback registered with `subscribe`/`p_subscribe`.
///
/// Invoked by the connection layer once per inbound message. `pattern` is set
/// when the message matched a pattern subscription.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, message: Message, pattern: Option<&str>);
}

/// Supplies broker connections
pub trait ConnectionProvider: Send + Sync {
    /// Open a new connection, failing with [`ConnectionError::Unreachable`](crate::ConnectionError::Unreachable)
    /// when the broker cannot be reached.
    fn get_connection(&self) -> ConnectionResult<Arc<dyn Connection>>;
}

/// A single broker connection
pub trait Connection: Send + Sync {
    /// Subscribe to exact channels, delivering to `sink`
    fn subscribe(&self, sink: Arc<dyn MessageSink>, channels: &[String]) -> ConnectionResult<()>;

    /// Subscribe to channel patterns, delivering to `sink`
    fn p_subscribe(&self, sink: Arc<dyn MessageSink>, patterns: &[String]) -> ConnectionResult<()>;

    /// Drive message delivery.
    ///
    /// Returns when the connection is closed, when no subscription remains,
    /// or right away for connections that deliver on their own threads.
    fn listen(&self) -> ConnectionResult<()>;

    /// The active subscription, if any
    fn subscription(&self) -> Option<Arc<dyn Subscription>>;

    fn is_subscribed(&self) -> bool;

    /// Release the connection and unblock `listen()`
    fn close(&self) -> ConnectionResult<()>;
}

/// Handle to an active subscription.
///
/// An empty name slice passed to `unsubscribe`/`p_unsubscribe` means "all".
pub trait Subscription: Send + Sync {
    fn subscribe(&self, channels: &[String]) -> ConnectionResult<()>;

    fn p_subscribe(&self, patterns: &[String]) -> ConnectionResult<()>;

    fn unsubscribe(&self, channels: &[String]) -> ConnectionResult<()>;

    fn p_unsubscribe(&self, patterns: &[String]) -> ConnectionResult<()>;

    /// Currently subscribed channels. Incremental changes are computed
    /// against this, so it must reflect completed commands.
    fn channels(&self) -> Vec<String>;

    /// Currently subscribed patterns
    fn patterns(&self) -> Vec<String>;

    /// Whether any channel or pattern is still subscribed
    fn is_alive(&self) -> bool {
        !self.channels().is_empty() || !self.patterns().is_empty()
    }
}
