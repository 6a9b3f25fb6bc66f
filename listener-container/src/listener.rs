//! Message listeners and listener failure reporting

use std::fmt;
use std::sync::Arc;

use crate::connection::Message;
use crate::error::ListenerError;
use crate::topic::Topic;

/// Receives messages for the topics it is registered under.
///
/// `topic` is the registered topic that matched: the channel itself for
/// channel subscriptions, the pattern for pattern subscriptions.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, topic: &Topic, message: &Message) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`MessageListener`]
pub struct FnListener<F> {
    handler: F,
}

impl<F> MessageListener for FnListener<F>
where
    F: Fn(&Topic, &Message) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_message(&self, topic: &Topic, message: &Message) -> Result<(), ListenerError> {
        (self.handler)(topic, message)
    }
}

/// Wrap a closure as a shareable listener handle
///
/// ```rust
/// use listener_container::{listener_fn, Topic};
///
/// let listener = listener_fn(|topic: &Topic, message: &listener_container::Message| {
///     println!("{} -> {:?}", topic, message.payload);
///     Ok(())
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F>(handler: F) -> Arc<dyn MessageListener>
where
    F: Fn(&Topic, &Message) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Arc::new(FnListener { handler })
}

/// Receives listener failures raised during dispatch
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, topic: &Topic, message: &Message, error: ListenerError);
}

/// Reports listener failures through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, topic: &Topic, message: &Message, error: ListenerError) {
        tracing::error!(
            "Listener for {} failed on message from channel '{}': {}",
            topic,
            message.channel,
            error
        );
    }
}

/// Identity-compared listener handle.
///
/// Two handles are equal when they point at the same listener allocation.
#[derive(Clone)]
pub(crate) struct ListenerHandle(pub Arc<dyn MessageListener>);

impl ListenerHandle {
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ListenerHandle {}

impl std::hash::Hash for ListenerHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle({:#x})", self.addr())
    }
}
