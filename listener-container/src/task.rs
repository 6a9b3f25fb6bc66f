//! Background subscription task
//!
//! A [`SubscriptionTask`] owns exactly one broker connection per run cycle.
//! It runs on the subscription executor and:
//!
//! - waits until at least one topic is registered
//! - opens a connection and subscribes every registered topic
//! - completes the start handshake, then parks in [`Connection::listen`]
//! - recovers with backoff when the connection is lost or cannot be opened
//!
//! The container cancels the task from its own thread. Cancellation
//! unsubscribes, closes the connection (which unblocks `listen()`) and waits
//! a bounded time for the run to finish. Failures on that path are logged and
//! swallowed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::RecoveryBackoff;
use crate::connection::{Connection, ConnectionProvider, MessageSink};
use crate::error::{ConnectionError, ConnectionResult};
use crate::interrupt;
use crate::registry::ListenerRegistry;
use crate::topic::TopicSet;

/// Result of waiting for the start handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Subscribed,
    TimedOut,
    Interrupted,
}

/// One-shot "subscribed" signal from the task to `start()`
#[derive(Default)]
pub(crate) struct Handshake {
    subscribed: Mutex<bool>,
    cond: Condvar,
}

impl Handshake {
    pub fn complete(&self) {
        let mut subscribed = self.subscribed.lock();
        if !*subscribed {
            *subscribed = true;
            self.cond.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.subscribed.lock()
    }

    /// Block the calling thread until the handshake completes, `timeout`
    /// elapses or the thread is interrupted. The interrupt flag is left set.
    pub fn wait(self: &Arc<Self>, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let target = Arc::clone(self);
        let _registration = interrupt::on_interrupt(move || {
            let _guard = target.subscribed.lock();
            target.cond.notify_all();
        });

        let mut subscribed = self.subscribed.lock();
        loop {
            if interrupt::is_interrupted() {
                return WaitOutcome::Interrupted;
            }
            if *subscribed {
                return WaitOutcome::Subscribed;
            }
            if self.cond.wait_until(&mut subscribed, deadline).timed_out() {
                return if interrupt::is_interrupted() {
                    WaitOutcome::Interrupted
                } else if *subscribed {
                    WaitOutcome::Subscribed
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }
}

#[derive(Default)]
struct TaskState {
    /// `run()` is executing
    running: bool,
    cancelled: bool,
    connection: Option<Arc<dyn Connection>>,
    /// The initial subscribe on `connection` has finished; registry changes
    /// are now applied to it directly
    synced: bool,
}

/// How one connect/subscribe/listen cycle ended
enum CycleOutcome {
    Cancelled,
    /// The connection keeps delivering on its own threads
    Detached,
    /// Every topic was unsubscribed; go back to waiting for topics
    Drained,
    /// The cycle never reached the subscribed state
    Failed(ConnectionError),
    /// The connection dropped after being subscribed
    Lost(ConnectionError),
}

pub(crate) struct SubscriptionTask {
    container: String,
    provider: Arc<dyn ConnectionProvider>,
    registry: Arc<ListenerRegistry>,
    sink: Arc<dyn MessageSink>,
    recovery: RecoveryBackoff,
    max_recovery_attempts: Option<u32>,
    handshake: Arc<Handshake>,
    state: Mutex<TaskState>,
    changed: Condvar,
    /// Serializes every incremental SUBSCRIBE/UNSUBSCRIBE
    commands: Mutex<()>,
}

impl SubscriptionTask {
    pub fn new(
        container: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
        registry: Arc<ListenerRegistry>,
        sink: Arc<dyn MessageSink>,
        recovery: RecoveryBackoff,
        max_recovery_attempts: Option<u32>,
    ) -> Self {
        Self {
            container: container.into(),
            provider,
            registry,
            sink,
            recovery,
            max_recovery_attempts,
            handshake: Arc::new(Handshake::default()),
            state: Mutex::new(TaskState::default()),
            changed: Condvar::new(),
            commands: Mutex::new(()),
        }
    }

    pub fn wait_subscribed(&self, timeout: Duration) -> WaitOutcome {
        self.handshake.wait(timeout)
    }

    /// Whether a subscribed connection is currently held
    pub fn is_listening(&self) -> bool {
        self.state
            .lock()
            .connection
            .as_ref()
            .map_or(false, |connection| connection.is_subscribed())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Task body, executed on the subscription executor
    pub fn run(&self) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                tracing::debug!("[{}] Subscription task cancelled before it ran", self.container);
                return;
            }
            state.running = true;
        }

        tracing::debug!("[{}] Subscription task started", self.container);
        self.run_cycles();

        let mut state = self.state.lock();
        state.running = false;
        self.changed.notify_all();
        tracing::debug!("[{}] Subscription task finished", self.container);
    }

    fn run_cycles(&self) {
        let mut failures: u32 = 0;
        loop {
            if !self.await_topics() {
                return;
            }

            let error = match self.run_cycle() {
                CycleOutcome::Cancelled | CycleOutcome::Detached => return,
                CycleOutcome::Drained => {
                    failures = 0;
                    continue;
                }
                CycleOutcome::Lost(error) => {
                    failures = 0;
                    tracing::warn!("[{}] Connection lost: {}", self.container, error);
                    error
                }
                CycleOutcome::Failed(error) => {
                    tracing::warn!(
                        "[{}] Subscription attempt {} failed: {}",
                        self.container,
                        failures + 1,
                        error
                    );
                    error
                }
            };

            if let Some(max) = self.max_recovery_attempts {
                if failures >= max {
                    tracing::error!(
                        "[{}] Giving up after {} recovery attempt(s), last error: {}",
                        self.container,
                        failures,
                        error
                    );
                    return;
                }
            }

            let delay = self.recovery.next(failures);
            failures = failures.saturating_add(1);
            tracing::info!("[{}] Retrying subscription in {:?}", self.container, delay);
            if !self.sleep_unless_cancelled(delay) {
                return;
            }
        }
    }

    fn run_cycle(&self) -> CycleOutcome {
        let connection = match self.provider.get_connection() {
            Ok(connection) => connection,
            Err(error) => return CycleOutcome::Failed(error),
        };

        if connection.is_subscribed() {
            close_quietly(&self.container, &*connection);
            return CycleOutcome::Failed(ConnectionError::AlreadySubscribed);
        }

        {
            let mut state = self.state.lock();
            if state.cancelled {
                drop(state);
                close_quietly(&self.container, &*connection);
                return CycleOutcome::Cancelled;
            }
            state.connection = Some(Arc::clone(&connection));
            state.synced = false;
        }

        let initial = self.registry.topic_set();
        if let Err(error) = self.subscribe_all(&*connection, &initial) {
            self.release(&connection);
            return if self.is_cancelled() {
                CycleOutcome::Cancelled
            } else {
                CycleOutcome::Failed(error)
            };
        }
        self.catch_up(&connection);

        tracing::info!(
            "[{}] Subscribed to {} channel(s) and {} pattern(s)",
            self.container,
            initial.channels.len(),
            initial.patterns.len()
        );
        self.handshake.complete();

        let result = connection.listen();
        if self.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        match result {
            Ok(()) if connection.is_subscribed() => {
                tracing::debug!(
                    "[{}] Connection delivers asynchronously, task detaching",
                    self.container
                );
                CycleOutcome::Detached
            }
            Ok(()) if self.registry.is_empty() => {
                self.release(&connection);
                CycleOutcome::Drained
            }
            Ok(()) => {
                self.release(&connection);
                CycleOutcome::Lost(ConnectionError::Closed)
            }
            Err(error) => {
                self.release(&connection);
                CycleOutcome::Lost(error)
            }
        }
    }

    fn subscribe_all(&self, connection: &dyn Connection, topics: &TopicSet) -> ConnectionResult<()> {
        if !topics.channels.is_empty() {
            tracing::debug!("[{}] SUBSCRIBE {:?}", self.container, topics.channels);
            connection.subscribe(Arc::clone(&self.sink), &topics.channels)?;
        }
        if !topics.patterns.is_empty() {
            tracing::debug!("[{}] PSUBSCRIBE {:?}", self.container, topics.patterns);
            connection.p_subscribe(Arc::clone(&self.sink), &topics.patterns)?;
        }
        Ok(())
    }

    /// Mark `connection` synced and apply registry changes made while the
    /// initial subscribe was in flight, in either direction.
    fn catch_up(&self, connection: &Arc<dyn Connection>) {
        let _commands = self.commands.lock();
        {
            let mut state = self.state.lock();
            let held = state
                .connection
                .as_ref()
                .map_or(false, |held| same_connection(held, connection));
            if !held {
                return;
            }
            state.synced = true;
        }
        self.reconcile(&**connection);
    }

    /// Park until a topic is registered. Completes the handshake while idle so
    /// a container without listeners still starts. False once cancelled.
    fn await_topics(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return false;
            }
            if !self.registry.is_empty() {
                return true;
            }
            if !self.handshake.is_complete() {
                tracing::debug!("[{}] No topics registered, waiting", self.container);
                self.handshake.complete();
            }
            self.changed.wait(&mut state);
        }
    }

    /// Sleep for `delay`; false if cancelled in the meantime.
    fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        while !state.cancelled {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return !state.cancelled;
            }
        }
        false
    }

    /// Called after the registry gained or lost topics. Wakes an idle task
    /// and, once the initial subscribe is done, brings the live subscription
    /// in line with the registry on the calling thread.
    pub fn sync(&self) {
        let _commands = self.commands.lock();
        let connection = {
            let state = self.state.lock();
            self.changed.notify_all();
            if !state.synced {
                tracing::debug!(
                    "[{}] Initial subscribe pending, change left to the subscription task",
                    self.container
                );
                return;
            }
            state.connection.clone()
        };

        if let Some(connection) = connection {
            self.reconcile(&*connection);
        }
    }

    /// Diff the registry against what the subscription reports and issue the
    /// difference. Caller holds `commands`.
    fn reconcile(&self, connection: &dyn Connection) {
        let Some(subscription) = connection.subscription() else {
            tracing::debug!("[{}] No active subscription to update", self.container);
            return;
        };

        let wanted = self.registry.topic_set();
        let channels = subscription.channels();
        let patterns = subscription.patterns();

        // Subscribes first: a connection left with zero topics ends listen().
        self.issue("SUBSCRIBE", &difference(&wanted.channels, &channels), |names| {
            subscription.subscribe(names)
        });
        self.issue("PSUBSCRIBE", &difference(&wanted.patterns, &patterns), |names| {
            subscription.p_subscribe(names)
        });
        self.issue("UNSUBSCRIBE", &difference(&channels, &wanted.channels), |names| {
            subscription.unsubscribe(names)
        });
        self.issue("PUNSUBSCRIBE", &difference(&patterns, &wanted.patterns), |names| {
            subscription.p_unsubscribe(names)
        });
    }

    /// An empty slice means "all" to the broker, so nothing is sent for it.
    fn issue(
        &self,
        command: &str,
        names: &[String],
        op: impl FnOnce(&[String]) -> ConnectionResult<()>,
    ) {
        if names.is_empty() {
            return;
        }
        tracing::debug!("[{}] {} {:?}", self.container, command, names);
        if let Err(error) = op(names) {
            tracing::warn!(
                "[{}] Incremental {} {:?} failed: {}",
                self.container,
                command,
                names,
                error
            );
        }
    }

    /// Stop the task: unsubscribe, close the connection and wait up to
    /// `teardown_wait` for `run()` to return. Never fails.
    pub fn cancel(&self, teardown_wait: Duration) {
        let connection = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.synced = false;
            self.changed.notify_all();
            state.connection.take()
        };

        if let Some(connection) = connection {
            self.teardown(&*connection);
        }

        let deadline = Instant::now() + teardown_wait;
        let mut state = self.state.lock();
        while state.running {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if state.running {
                    tracing::warn!(
                        "[{}] Subscription task still running after {:?}",
                        self.container,
                        teardown_wait
                    );
                }
                break;
            }
        }
    }

    fn teardown(&self, connection: &dyn Connection) {
        let subscribed = guarded(&self.container, "is_subscribed", || {
            Ok(connection.is_subscribed())
        })
        .unwrap_or(false);

        if subscribed {
            match guarded(&self.container, "subscription", || Ok(connection.subscription())) {
                Some(Some(subscription)) => {
                    tracing::debug!("[{}] Unsubscribing all topics", self.container);
                    guarded(&self.container, "UNSUBSCRIBE", || subscription.unsubscribe(&[]));
                    guarded(&self.container, "PUNSUBSCRIBE", || subscription.p_unsubscribe(&[]));
                }
                _ => tracing::debug!("[{}] No subscription handle to unsubscribe", self.container),
            }
        }

        close_quietly(&self.container, connection);
    }

    /// Close `connection` if the task still owns it
    fn release(&self, connection: &Arc<dyn Connection>) {
        let owned = {
            let mut state = self.state.lock();
            let same = state
                .connection
                .as_ref()
                .map_or(false, |held| same_connection(held, connection));
            if same {
                state.synced = false;
                state.connection.take()
            } else {
                None
            }
        };

        if let Some(connection) = owned {
            close_quietly(&self.container, &*connection);
        }
    }
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Names in `from` missing from `without`
fn difference(from: &[String], without: &[String]) -> Vec<String> {
    from.iter()
        .filter(|name| !without.contains(name))
        .cloned()
        .collect()
}

fn close_quietly(container: &str, connection: &dyn Connection) {
    guarded(container, "close", || connection.close());
}

/// Run a collaborator call, logging errors and panics instead of propagating.
fn guarded<T>(container: &str, op: &str, f: impl FnOnce() -> ConnectionResult<T>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            tracing::warn!("[{}] {} failed: {}", container, op, error);
            None
        }
        Err(_) => {
            tracing::warn!("[{}] {} panicked", container, op);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_handshake_completes_before_timeout() {
        let handshake = Arc::new(Handshake::default());
        let signal = Arc::clone(&handshake);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.complete();
        });

        assert_eq!(
            handshake.wait(Duration::from_secs(5)),
            WaitOutcome::Subscribed
        );
        worker.join().unwrap();
    }

    #[test]
    fn test_handshake_times_out() {
        let handshake = Arc::new(Handshake::default());
        let started = Instant::now();
        assert_eq!(
            handshake.wait(Duration::from_millis(50)),
            WaitOutcome::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_handshake_interrupted_from_other_thread() {
        let handshake = Arc::new(Handshake::default());
        let me = interrupt::current();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            me.interrupt();
        });

        let started = Instant::now();
        assert_eq!(
            handshake.wait(Duration::from_secs(10)),
            WaitOutcome::Interrupted
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(interrupt::interrupted());
        worker.join().unwrap();
    }

    #[test]
    fn test_pending_interrupt_wins_over_completion() {
        let handshake = Arc::new(Handshake::default());
        handshake.complete();
        interrupt::current().interrupt();

        assert_eq!(
            handshake.wait(Duration::from_secs(1)),
            WaitOutcome::Interrupted
        );
        assert!(interrupt::interrupted());
        assert_eq!(
            handshake.wait(Duration::from_secs(1)),
            WaitOutcome::Subscribed
        );
    }

    #[test]
    fn test_difference() {
        let current = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let initial = vec!["b".to_string()];
        assert_eq!(
            difference(&current, &initial),
            vec!["a".to_string(), "c".to_string()]
        );
    }
}
