//! Error types for the listener container.
//!
//! Only [`ContainerError`] is ever returned from the container's lifecycle
//! methods. Connection, executor and listener failures are environmental:
//! they are logged and absorbed by the layer that observed them.

use thiserror::Error;

/// Errors surfaced to callers of [`ListenerContainer`](crate::ListenerContainer)
#[derive(Error, Debug)]
pub enum ContainerError {
    /// `start()` was called while the container is already running or starting
    #[error("Container '{0}' is already running")]
    AlreadyRunning(String),

    /// The container was destroyed and cannot be used again
    #[error("Container '{0}' has been destroyed")]
    Destroyed(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors raised by a broker connection or its subscription handle.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The broker could not be reached
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The connection handed out by the provider is already subscribed
    #[error("Retrieved connection is already subscribed")]
    AlreadySubscribed,

    /// The connection has been closed
    #[error("Connection closed")]
    Closed,

    /// A broker command failed
    #[error("{command} failed: {reason}")]
    Command {
        command: &'static str,
        reason: String,
    },
}

/// Errors from an execution context.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The executor no longer accepts work
    #[error("Task rejected: {0}")]
    Rejected(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors reported by message listeners.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The listener rejected or failed to process the message
    #[error("Listener failed: {0}")]
    Failed(String),

    /// The listener panicked while handling the message
    #[error("Listener panicked: {0}")]
    Panicked(String),
}

/// Result type for container lifecycle operations
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Result type for connection operations
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
