//! # Pub/Sub Listener Container
//!
//! A sync-first container that manages one background subscription to a
//! pub/sub broker and dispatches inbound messages to registered listeners.
//!
//! ## Overview
//!
//! The container coordinates three things that fail independently: the
//! broker subscription, the background thread that drives it, and callers
//! starting and stopping the container from arbitrary threads. Whatever
//! happens, the container ends up either fully running or stopped.
//!
//! ## Key Features
//!
//! - **Serialized lifecycle**: `start`/`stop`/`destroy` never overlap; `is_running()` is lock-free
//! - **Bounded start**: `start()` waits a configurable time for the subscription to be confirmed
//! - **Interruptible start**: interrupting the starting thread cancels the start cleanly
//! - **Forgiving stop**: unsubscribe and close failures are logged, `stop()` always completes
//! - **Live registration**: listeners can be added or removed while running
//! - **Recovery**: lost or unreachable connections are retried with backoff
//! - **Pluggable execution**: subscription and dispatch run on injectable executors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use listener_container::{listener_fn, ContainerConfig, ListenerContainer, Topic};
//!
//! let container = ListenerContainer::builder(Arc::new(redis_provider))
//!     .config(ContainerConfig::new().with_name("orders"))
//!     .listener(
//!         listener_fn(|topic, message| {
//!             println!("{}: {:?}", topic, message.payload);
//!             Ok(())
//!         }),
//!         [Topic::channel("orders.created"), Topic::pattern("orders.*")],
//!     )
//!     .build()?;
//!
//! container.start()?;
//! // ...
//! container.stop();
//! container.destroy()?;
//! ```
//!
//! ## Architecture
//!
//! 1. **ListenerRegistry**: topic to listener bindings, read on every message
//! 2. **SubscriptionTask**: owns the connection, subscribes, parks in the receive loop
//! 3. **ListenerContainer**: the `Stopped → Starting → Running → Stopping` state machine
//!
//! The broker itself is reached through the traits in [`connection`];
//! [`MemoryBroker`] is an in-process implementation.

pub mod config;
pub mod connection;
pub mod container;
mod dispatch;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod listener;
pub mod logging;
pub mod memory;
pub mod registry;
mod task;
pub mod topic;

// Re-export main types for convenience
pub use config::{ContainerConfig, RecoveryBackoff};
pub use connection::{Connection, ConnectionProvider, Message, MessageSink, Subscription};
pub use container::{ContainerBuilder, ContainerState, ListenerContainer};
pub use error::{
    ConnectionError, ConnectionResult, ContainerError, ExecutorError, ListenerError, Result,
};
pub use executor::{SyncExecutor, Task, TaskExecutor, ThreadExecutor};
pub use interrupt::Interrupter;
pub use listener::{listener_fn, ErrorHandler, FnListener, LoggingErrorHandler, MessageListener};
pub use memory::MemoryBroker;
pub use registry::ListenerRegistry;
pub use topic::Topic;

/// Prelude module for convenient imports
///
/// ```rust
/// use listener_container::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        listener_fn, ContainerConfig, ContainerError, ContainerState, ListenerContainer,
        ListenerError, Message, MessageListener, Result, Topic,
    };
}
