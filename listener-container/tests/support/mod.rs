//! Recording collaborators for container integration tests.
//!
//! `MockBroker` hands out `MockConnection`s that block in `listen()` until
//! closed or fully unsubscribed, like a blocking broker client. Every call is
//! appended to a shared log so tests can assert on ordering, and each failure
//! mode can be switched on individually.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use listener_container::{
    interrupt, Connection, ConnectionError, ConnectionProvider, ConnectionResult, ExecutorError,
    ListenerError, Message, MessageListener, MessageSink, Subscription, Task, TaskExecutor, Topic,
};
use parking_lot::{Condvar, Mutex};

/// Shared, ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries whose command (text before ':') equals `command`
    pub fn calls(&self, command: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.split(':').next() == Some(command))
            .cloned()
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls(command).len()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }
}

/// Failure switches shared by a broker and every connection it creates
#[derive(Clone, Default)]
pub struct Failures {
    pub unreachable: Arc<AtomicBool>,
    pub already_subscribed: Arc<AtomicBool>,
    pub subscribe: Arc<AtomicBool>,
    pub unsubscribe: Arc<AtomicBool>,
    pub p_unsubscribe: Arc<AtomicBool>,
    pub close: Arc<AtomicBool>,
}

impl Failures {
    pub fn set(flag: &AtomicBool, enabled: bool) {
        flag.store(enabled, Ordering::SeqCst);
    }

    fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

/// Parks callers of `pass()` while closed
#[derive(Clone, Default)]
pub struct Gate {
    closed: Arc<Mutex<bool>>,
    opened: Arc<Condvar>,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn open(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let mut closed = self.closed.lock();
        while *closed {
            self.opened.wait(&mut closed);
        }
    }
}

/// Gates on the connection-level subscribe calls that start a cycle
#[derive(Clone, Default)]
pub struct Gates {
    pub subscribe: Gate,
    pub p_subscribe: Gate,
}

/// Connection provider recording every connection it hands out
#[derive(Clone, Default)]
pub struct MockBroker {
    pub log: CallLog,
    pub failures: Failures,
    pub gates: Gates,
    connection_requests: Arc<AtomicU32>,
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_requests(&self) -> u32 {
        self.connection_requests.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }

    /// Simulate the broker dropping the currently open connections
    pub fn drop_connections(&self) {
        for connection in self.connections() {
            connection.drop_from_broker();
        }
    }

    /// Deliver a message on every open connection subscribed to `channel`
    pub fn publish(&self, channel: &str, payload: &str) {
        for connection in self.connections() {
            connection.deliver(channel, payload);
        }
    }
}

impl ConnectionProvider for MockBroker {
    fn get_connection(&self) -> ConnectionResult<Arc<dyn Connection>> {
        self.connection_requests.fetch_add(1, Ordering::SeqCst);
        self.log.push("connect");
        if Failures::is_set(&self.failures.unreachable) {
            return Err(ConnectionError::Unreachable("mock broker down".to_string()));
        }

        let connection =
            MockConnection::new(self.log.clone(), self.failures.clone(), self.gates.clone());
        if Failures::is_set(&self.failures.already_subscribed) {
            connection.state.lock().channels.insert("stale".to_string());
        }
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Default)]
struct MockState {
    sink: Option<Arc<dyn MessageSink>>,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    closed: bool,
}

impl MockState {
    fn is_subscribed(&self) -> bool {
        !self.closed && (!self.channels.is_empty() || !self.patterns.is_empty())
    }
}

pub struct MockConnection {
    me: Weak<MockConnection>,
    log: CallLog,
    failures: Failures,
    gates: Gates,
    state: Mutex<MockState>,
    changed: Condvar,
    closes: AtomicU32,
}

impl MockConnection {
    fn new(log: CallLog, failures: Failures, gates: Gates) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            log,
            failures,
            gates,
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            closes: AtomicU32::new(0),
        })
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.state.lock().channels.iter().cloned().collect()
    }

    pub fn subscribed_patterns(&self) -> Vec<String> {
        self.state.lock().patterns.iter().cloned().collect()
    }

    fn drop_from_broker(&self) {
        let mut state = self.state.lock();
        state.channels.clear();
        state.patterns.clear();
        self.changed.notify_all();
    }

    fn deliver(&self, channel: &str, payload: &str) {
        let sink = {
            let state = self.state.lock();
            if !state.is_subscribed() || !state.channels.contains(channel) {
                return;
            }
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.on_message(Message::new(channel, payload.to_string()), None);
        }
    }

    fn register(
        &self,
        command: &str,
        sink: Option<Arc<dyn MessageSink>>,
        names: &[String],
        patterns: bool,
    ) -> ConnectionResult<()> {
        self.log.push(format!("{}:{}", command, names.join(",")));
        if Failures::is_set(&self.failures.subscribe) {
            return Err(ConnectionError::Command {
                command: "SUBSCRIBE",
                reason: "mock failure".to_string(),
            });
        }
        if sink.is_some() {
            let gate = if patterns {
                &self.gates.p_subscribe
            } else {
                &self.gates.subscribe
            };
            gate.pass();
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if let Some(sink) = sink {
            state.sink = Some(sink);
        }
        let target = if patterns {
            &mut state.patterns
        } else {
            &mut state.channels
        };
        target.extend(names.iter().cloned());
        Ok(())
    }

    fn unregister(&self, command: &str, names: &[String], patterns: bool) -> ConnectionResult<()> {
        self.log.push(format!("{}:{}", command, names.join(",")));
        let failing = if patterns {
            &self.failures.p_unsubscribe
        } else {
            &self.failures.unsubscribe
        };
        if Failures::is_set(failing) {
            return Err(ConnectionError::Command {
                command: "UNSUBSCRIBE",
                reason: "mock failure".to_string(),
            });
        }

        let mut state = self.state.lock();
        let target = if patterns {
            &mut state.patterns
        } else {
            &mut state.channels
        };
        if names.is_empty() {
            target.clear();
        } else {
            for name in names {
                target.remove(name);
            }
        }
        self.changed.notify_all();
        Ok(())
    }
}

impl Connection for MockConnection {
    fn subscribe(&self, sink: Arc<dyn MessageSink>, channels: &[String]) -> ConnectionResult<()> {
        self.register("subscribe", Some(sink), channels, false)
    }

    fn p_subscribe(&self, sink: Arc<dyn MessageSink>, patterns: &[String]) -> ConnectionResult<()> {
        self.register("psubscribe", Some(sink), patterns, true)
    }

    fn listen(&self) -> ConnectionResult<()> {
        let mut state = self.state.lock();
        while state.is_subscribed() {
            self.changed.wait(&mut state);
        }
        Ok(())
    }

    fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        let state = self.state.lock();
        if !state.is_subscribed() {
            return None;
        }
        drop(state);
        let connection = self.me.upgrade()?;
        Some(Arc::new(MockSubscription { connection }))
    }

    fn is_subscribed(&self) -> bool {
        self.state.lock().is_subscribed()
    }

    fn close(&self) -> ConnectionResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.log.push("close");
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
        drop(state);

        if Failures::is_set(&self.failures.close) {
            return Err(ConnectionError::Command {
                command: "QUIT",
                reason: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

struct MockSubscription {
    connection: Arc<MockConnection>,
}

impl Subscription for MockSubscription {
    fn subscribe(&self, channels: &[String]) -> ConnectionResult<()> {
        self.connection.register("subscribe", None, channels, false)
    }

    fn p_subscribe(&self, patterns: &[String]) -> ConnectionResult<()> {
        self.connection.register("psubscribe", None, patterns, true)
    }

    fn unsubscribe(&self, channels: &[String]) -> ConnectionResult<()> {
        self.connection.unregister("unsubscribe", channels, false)
    }

    fn p_unsubscribe(&self, patterns: &[String]) -> ConnectionResult<()> {
        self.connection.unregister("punsubscribe", patterns, true)
    }

    fn channels(&self) -> Vec<String> {
        self.connection.subscribed_channels()
    }

    fn patterns(&self) -> Vec<String> {
        self.connection.subscribed_patterns()
    }
}

/// Spawns a thread per task and counts submissions
#[derive(Clone, Default)]
pub struct SpawningExecutor {
    pub executed: Arc<AtomicU32>,
}

impl TaskExecutor for SpawningExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        thread::spawn(task);
        Ok(())
    }
}

/// Interrupts the submitting thread, then runs the task on a new thread
#[derive(Clone, Default)]
pub struct InterruptingExecutor {
    pub executed: Arc<AtomicU32>,
}

impl TaskExecutor for InterruptingExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        interrupt::current().interrupt();
        thread::spawn(task);
        Ok(())
    }
}

/// Accepts tasks and never runs them
#[derive(Clone, Default)]
pub struct ParkingExecutor {
    parked: Arc<Mutex<Vec<Task>>>,
}

impl ParkingExecutor {
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }
}

impl TaskExecutor for ParkingExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.parked.lock().push(task);
        Ok(())
    }
}

/// Rejects every task
#[derive(Clone, Copy, Default)]
pub struct RejectingExecutor;

impl TaskExecutor for RejectingExecutor {
    fn execute(&self, _task: Task) -> Result<(), ExecutorError> {
        Err(ExecutorError::Rejected("mock executor saturated".to_string()))
    }
}

/// Listener recording every (topic, channel, payload) it receives
#[derive(Default)]
pub struct RecordingListener {
    received: Mutex<Vec<(Topic, String, String)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<(Topic, String, String)> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

impl MessageListener for RecordingListener {
    fn on_message(&self, topic: &Topic, message: &Message) -> Result<(), ListenerError> {
        self.received.lock().push((
            topic.clone(),
            message.channel.clone(),
            String::from_utf8_lossy(&message.payload).into_owned(),
        ));
        Ok(())
    }
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
