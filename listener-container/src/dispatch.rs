//! Inbound message dispatch
//!
//! [`DispatchSink`] is the sink the subscription task registers with the
//! connection. It resolves each message to the topic that matched, looks the
//! topic up in the registry and hands every listener invocation to the task
//! executor. Failing or panicking listeners are reported to the error handler
//! and never reach the other listeners or the receive loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::{Message, MessageSink};
use crate::error::ListenerError;
use crate::executor::TaskExecutor;
use crate::listener::{ErrorHandler, MessageListener};
use crate::registry::ListenerRegistry;
use crate::topic::Topic;

pub(crate) struct DispatchSink {
    registry: Arc<ListenerRegistry>,
    executor: Arc<dyn TaskExecutor>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl DispatchSink {
    pub fn new(
        registry: Arc<ListenerRegistry>,
        executor: Arc<dyn TaskExecutor>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            registry,
            executor,
            error_handler,
        }
    }
}

impl MessageSink for DispatchSink {
    fn on_message(&self, message: Message, pattern: Option<&str>) {
        let topic = match pattern {
            Some(pattern) => Topic::pattern(pattern),
            None => Topic::channel(message.channel.clone()),
        };

        let listeners = self.registry.listeners(&topic);
        if listeners.is_empty() {
            tracing::trace!("No listener registered for {}, dropping message", topic);
            return;
        }

        let topic = Arc::new(topic);
        let message = Arc::new(message);
        for listener in listeners {
            let topic_for_task = Arc::clone(&topic);
            let message_for_task = Arc::clone(&message);
            let error_handler = Arc::clone(&self.error_handler);

            let submitted = self.executor.execute(Box::new(move || {
                invoke(&*listener, &topic_for_task, &message_for_task, &*error_handler);
            }));

            if let Err(e) = submitted {
                tracing::warn!("Could not dispatch message for {}: {}", topic, e);
            }
        }
    }
}

/// Call one listener, routing failures and panics to `error_handler`.
fn invoke(
    listener: &dyn MessageListener,
    topic: &Topic,
    message: &Message,
    error_handler: &dyn ErrorHandler,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_message(topic, message)));
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(payload) => ListenerError::Panicked(panic_message(payload.as_ref())),
    };
    error_handler.handle_error(topic, message, error);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
