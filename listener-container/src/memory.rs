//! In-process broker
//!
//! [`MemoryBroker`] implements the collaborator traits entirely in memory so
//! containers can be exercised without a network broker. Connections behave
//! like blocking clients: [`Connection::listen`] parks on a channel until a
//! message arrives, every subscription is gone, or the connection is closed.
//!
//! Patterns use glob syntax (`*`, `?`, `[...]`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionProvider, Message, MessageSink, Subscription};
use crate::error::{ConnectionError, ConnectionResult};

enum Delivery {
    Message(Message, Option<String>),
    /// Re-check subscription and close state
    Wake,
}

#[derive(Default)]
struct ConnectionState {
    sink: Option<Arc<dyn MessageSink>>,
    channels: BTreeSet<String>,
    patterns: BTreeMap<String, GlobMatcher>,
    closed: bool,
}

impl ConnectionState {
    fn is_subscribed(&self) -> bool {
        !self.closed && (!self.channels.is_empty() || !self.patterns.is_empty())
    }
}

struct SharedConnection {
    id: Uuid,
    state: Mutex<ConnectionState>,
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
}

impl SharedConnection {
    fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(ConnectionState::default()),
            tx,
            rx,
        }
    }

    /// Queue `message` for every matching subscription; returns the number queued
    fn offer(&self, message: &Message) -> usize {
        let state = self.state.lock();
        if state.closed {
            return 0;
        }

        let mut queued = 0;
        if state.channels.contains(&message.channel) {
            let _ = self.tx.send(Delivery::Message(message.clone(), None));
            queued += 1;
        }
        for (pattern, matcher) in &state.patterns {
            if matcher.is_match(&message.channel) {
                let _ = self
                    .tx
                    .send(Delivery::Message(message.clone(), Some(pattern.clone())));
                queued += 1;
            }
        }
        queued
    }

    fn wake(&self) {
        let _ = self.tx.send(Delivery::Wake);
    }

    /// Mark closed; true if this call closed it
    fn shut(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.channels.clear();
        state.patterns.clear();
        state.sink = None;
        drop(state);
        self.wake();
        true
    }

    fn add_channels(&self, sink: Option<Arc<dyn MessageSink>>, channels: &[String]) -> ConnectionResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if let Some(sink) = sink {
            state.sink = Some(sink);
        } else if state.sink.is_none() {
            return Err(not_subscribed("SUBSCRIBE"));
        }
        state.channels.extend(channels.iter().cloned());
        Ok(())
    }

    fn add_patterns(&self, sink: Option<Arc<dyn MessageSink>>, patterns: &[String]) -> ConnectionResult<()> {
        let matchers = patterns
            .iter()
            .map(|pattern| compile(pattern).map(|matcher| (pattern.clone(), matcher)))
            .collect::<ConnectionResult<Vec<_>>>()?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if let Some(sink) = sink {
            state.sink = Some(sink);
        } else if state.sink.is_none() {
            return Err(not_subscribed("PSUBSCRIBE"));
        }
        state.patterns.extend(matchers);
        Ok(())
    }

    fn remove_channels(&self, channels: &[String]) -> ConnectionResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if channels.is_empty() {
            state.channels.clear();
        } else {
            for channel in channels {
                state.channels.remove(channel);
            }
        }
        let drained = !state.is_subscribed();
        drop(state);
        if drained {
            self.wake();
        }
        Ok(())
    }

    fn remove_patterns(&self, patterns: &[String]) -> ConnectionResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if patterns.is_empty() {
            state.patterns.clear();
        } else {
            for pattern in patterns {
                state.patterns.remove(pattern);
            }
        }
        let drained = !state.is_subscribed();
        drop(state);
        if drained {
            self.wake();
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> ConnectionResult<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| ConnectionError::Command {
            command: "PSUBSCRIBE",
            reason: e.to_string(),
        })
}

fn not_subscribed(command: &'static str) -> ConnectionError {
    ConnectionError::Command {
        command,
        reason: "connection is not in subscribed mode".to_string(),
    }
}

#[derive(Default)]
struct BrokerInner {
    connections: DashMap<Uuid, Arc<SharedConnection>>,
    offline: AtomicBool,
}

/// In-memory pub/sub broker; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` to `channel`, returning the number of deliveries queued
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        let message = Message::new(channel, payload);
        let delivered: usize = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().offer(&message))
            .sum();
        tracing::trace!("PUBLISH {} reached {} subscription(s)", channel, delivered);
        delivered
    }

    /// Simulate the broker going down or coming back
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of open connections subscribed to exactly `channel`
    pub fn channel_subscribers(&self, channel: &str) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.value().state.lock().channels.contains(channel))
            .count()
    }

    /// Drop every open connection from the broker side
    pub fn disconnect_all(&self) {
        let connections: Vec<Arc<SharedConnection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.connections.clear();

        for connection in connections {
            connection.shut();
        }
    }
}

impl ConnectionProvider for MemoryBroker {
    fn get_connection(&self) -> ConnectionResult<Arc<dyn Connection>> {
        if !self.is_online() {
            return Err(ConnectionError::Unreachable("memory broker is offline".to_string()));
        }

        let shared = Arc::new(SharedConnection::new());
        self.inner.connections.insert(shared.id, Arc::clone(&shared));
        tracing::trace!("Memory connection {} opened", shared.id);

        Ok(Arc::new(MemoryConnection {
            shared,
            broker: Arc::downgrade(&self.inner),
        }))
    }
}

/// Connection handed out by [`MemoryBroker`]
pub struct MemoryConnection {
    shared: Arc<SharedConnection>,
    broker: Weak<BrokerInner>,
}

impl MemoryConnection {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }
}

impl Connection for MemoryConnection {
    fn subscribe(&self, sink: Arc<dyn MessageSink>, channels: &[String]) -> ConnectionResult<()> {
        self.shared.add_channels(Some(sink), channels)
    }

    fn p_subscribe(&self, sink: Arc<dyn MessageSink>, patterns: &[String]) -> ConnectionResult<()> {
        self.shared.add_patterns(Some(sink), patterns)
    }

    fn listen(&self) -> ConnectionResult<()> {
        loop {
            {
                let state = self.shared.state.lock();
                if !state.is_subscribed() {
                    return Ok(());
                }
            }

            match self.shared.rx.recv() {
                Ok(Delivery::Message(message, pattern)) => {
                    let sink = self.shared.state.lock().sink.clone();
                    if let Some(sink) = sink {
                        sink.on_message(message, pattern.as_deref());
                    }
                }
                Ok(Delivery::Wake) => {}
                Err(_) => return Err(ConnectionError::Closed),
            }
        }
    }

    fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        if !self.is_subscribed() {
            return None;
        }
        Some(Arc::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn is_subscribed(&self) -> bool {
        self.shared.state.lock().is_subscribed()
    }

    fn close(&self) -> ConnectionResult<()> {
        if self.shared.shut() {
            tracing::trace!("Memory connection {} closed", self.shared.id);
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.connections.remove(&self.shared.id);
        }
        Ok(())
    }
}

/// Subscription handle of a [`MemoryConnection`]
pub struct MemorySubscription {
    shared: Arc<SharedConnection>,
}

impl Subscription for MemorySubscription {
    fn subscribe(&self, channels: &[String]) -> ConnectionResult<()> {
        self.shared.add_channels(None, channels)
    }

    fn p_subscribe(&self, patterns: &[String]) -> ConnectionResult<()> {
        self.shared.add_patterns(None, patterns)
    }

    fn unsubscribe(&self, channels: &[String]) -> ConnectionResult<()> {
        self.shared.remove_channels(channels)
    }

    fn p_unsubscribe(&self, patterns: &[String]) -> ConnectionResult<()> {
        self.shared.remove_patterns(patterns)
    }

    fn channels(&self) -> Vec<String> {
        self.shared.state.lock().channels.iter().cloned().collect()
    }

    fn patterns(&self) -> Vec<String> {
        self.shared.state.lock().patterns.keys().cloned().collect()
    }
}
