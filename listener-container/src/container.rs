//! Listener container lifecycle
//!
//! [`ListenerContainer`] owns the state machine
//!
//! ```text
//! Stopped --start()--> Starting --subscribed--> Running
//! Starting --timeout/interrupt--> Stopped
//! Running --stop()--> Stopping --teardown (any outcome)--> Stopped
//! ```
//!
//! Transitions are serialized by a single guard. `is_running()` is a lock-free
//! read of the last completed transition.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ContainerConfig;
use crate::connection::{ConnectionProvider, MessageSink};
use crate::dispatch::DispatchSink;
use crate::error::{ContainerError, Result};
use crate::executor::{SyncExecutor, TaskExecutor, ThreadExecutor};
use crate::listener::{ErrorHandler, LoggingErrorHandler, MessageListener};
use crate::registry::ListenerRegistry;
use crate::task::{SubscriptionTask, WaitOutcome};
use crate::topic::Topic;

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContainerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ContainerState::Starting,
            2 => ContainerState::Running,
            3 => ContainerState::Stopping,
            _ => ContainerState::Stopped,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// An executor plus whether the container created it (and must shut it down)
struct ExecutorSlot {
    executor: Arc<dyn TaskExecutor>,
    managed: bool,
}

impl ExecutorSlot {
    fn resolve(
        supplied: Option<Arc<dyn TaskExecutor>>,
        default: impl FnOnce() -> Arc<dyn TaskExecutor>,
    ) -> Self {
        match supplied {
            Some(executor) => Self {
                executor,
                managed: false,
            },
            None => Self {
                executor: default(),
                managed: true,
            },
        }
    }

    fn release(&self) {
        if self.managed {
            self.executor.shutdown();
        }
    }
}

/// Manages one background subscription and dispatches inbound messages to
/// registered listeners.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use listener_container::{listener_fn, ListenerContainer, MemoryBroker, Topic};
///
/// let broker = MemoryBroker::new();
/// let container = ListenerContainer::builder(Arc::new(broker.clone()))
///     .listener(listener_fn(|_, _| Ok(())), [Topic::channel("news")])
///     .build()?;
///
/// container.start()?;
/// assert!(container.is_running());
///
/// container.stop();
/// assert!(!container.is_running());
/// container.destroy()?;
/// # Ok::<(), listener_container::ContainerError>(())
/// ```
pub struct ListenerContainer {
    config: ContainerConfig,
    provider: Arc<dyn ConnectionProvider>,
    registry: Arc<ListenerRegistry>,
    sink: Arc<dyn MessageSink>,
    subscription_executor: ExecutorSlot,
    task_executor: ExecutorSlot,
    state: AtomicU8,
    destroyed: AtomicBool,
    /// Serializes start/stop/destroy
    transition: Mutex<()>,
    current_task: Mutex<Option<Arc<SubscriptionTask>>>,
}

impl ListenerContainer {
    /// Start building a container around `provider`
    pub fn builder(provider: Arc<dyn ConnectionProvider>) -> ContainerBuilder {
        ContainerBuilder::new(provider)
    }

    /// Create a container with default executors and no listeners
    pub fn new(provider: Arc<dyn ConnectionProvider>, config: ContainerConfig) -> Result<Self> {
        ContainerBuilder::new(provider).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    /// Whether the subscription task currently holds a subscribed connection
    pub fn is_listening(&self) -> bool {
        self.current_task()
            .map_or(false, |task| task.is_listening())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Start listening.
    ///
    /// Submits the subscription task and blocks for up to
    /// `max_subscription_registration_waiting_time` until every registered
    /// topic is subscribed. A timeout, a rejected task or an interrupt of the
    /// calling thread cancels the start: the call still returns `Ok(())` and
    /// the container stays stopped. An interrupt leaves the thread's flag set.
    ///
    /// Fails when the container is already running or has been destroyed.
    pub fn start(&self) -> Result<()> {
        let _transition = self.transition.lock();
        self.ensure_usable()?;

        match self.state() {
            ContainerState::Running | ContainerState::Starting => {
                return Err(ContainerError::AlreadyRunning(self.config.name.clone()));
            }
            ContainerState::Stopped | ContainerState::Stopping => {}
        }

        self.set_state(ContainerState::Starting);
        tracing::info!("[{}] Starting listener container", self.config.name);

        let task = Arc::new(SubscriptionTask::new(
            self.config.name.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
            self.config.recovery,
            self.config.max_recovery_attempts,
        ));
        *self.current_task.lock() = Some(Arc::clone(&task));

        let runner = Arc::clone(&task);
        if let Err(error) = self
            .subscription_executor
            .executor
            .execute(Box::new(move || runner.run()))
        {
            tracing::error!(
                "[{}] Subscription task was rejected: {}",
                self.config.name,
                error
            );
            self.abort_start(&task);
            return Ok(());
        }

        let wait = self.config.max_subscription_registration_waiting_time;
        match task.wait_subscribed(wait) {
            WaitOutcome::Subscribed => {
                self.set_state(ContainerState::Running);
                tracing::info!("[{}] Listener container running", self.config.name);
            }
            WaitOutcome::Interrupted => {
                tracing::warn!(
                    "[{}] Interrupted while waiting for subscription, start cancelled",
                    self.config.name
                );
                self.abort_start(&task);
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    "[{}] Subscription not confirmed within {:?}, start cancelled",
                    self.config.name,
                    wait
                );
                self.abort_start(&task);
            }
        }

        Ok(())
    }

    /// Stop listening.
    ///
    /// No-op unless running. Unsubscribes every topic and closes the
    /// connection; failures are logged, never returned. Always ends stopped.
    pub fn stop(&self) {
        let _transition = self.transition.lock();
        self.stop_locked();
    }

    /// Stop if needed, release managed executors and refuse further use.
    pub fn destroy(&self) -> Result<()> {
        let _transition = self.transition.lock();
        self.ensure_usable()?;

        self.stop_locked();
        self.destroyed.store(true, Ordering::Release);

        self.subscription_executor.release();
        self.task_executor.release();
        tracing::info!("[{}] Listener container destroyed", self.config.name);
        Ok(())
    }

    /// Bind `listener` to `topic`.
    ///
    /// If the topic had no listener and the container is live, an incremental
    /// subscribe is issued for that topic only. Errors are logged.
    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>, topic: Topic) {
        self.add_message_listener_topics(listener, [topic]);
    }

    /// Bind `listener` to several topics at once
    pub fn add_message_listener_topics<I>(&self, listener: Arc<dyn MessageListener>, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        let activated = self.registry.add(&listener, topics);
        if activated.is_empty() {
            return;
        }

        tracing::debug!(
            "[{}] First listener registered for {} topic(s)",
            self.config.name,
            activated.len()
        );
        if let Some(task) = self.current_task() {
            task.sync();
        }
    }

    /// Unbind `listener` from `topic`, unsubscribing the topic if it was the last listener
    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>, topic: Topic) {
        self.remove_message_listener_topics(listener, [topic]);
    }

    pub fn remove_message_listener_topics<I>(&self, listener: &Arc<dyn MessageListener>, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        let deactivated = self.registry.remove(listener, topics);
        self.deactivate(deactivated);
    }

    /// Unbind `listener` from every topic
    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) {
        let deactivated = self.registry.remove_listener(listener);
        self.deactivate(deactivated);
    }

    fn deactivate(&self, topics: Vec<Topic>) {
        if topics.is_empty() {
            return;
        }

        tracing::debug!(
            "[{}] Last listener removed for {} topic(s)",
            self.config.name,
            topics.len()
        );
        if let Some(task) = self.current_task() {
            task.sync();
        }
    }

    fn stop_locked(&self) {
        match self.state() {
            ContainerState::Running | ContainerState::Starting => {}
            ContainerState::Stopped | ContainerState::Stopping => return,
        }

        self.set_state(ContainerState::Stopping);
        tracing::info!("[{}] Stopping listener container", self.config.name);

        let task = self.current_task.lock().take();
        if let Some(task) = task {
            task.cancel(self.config.max_teardown_wait);
        }

        self.set_state(ContainerState::Stopped);
        tracing::info!("[{}] Listener container stopped", self.config.name);
    }

    fn abort_start(&self, task: &SubscriptionTask) {
        self.current_task.lock().take();
        task.cancel(self.config.max_teardown_wait);
        self.set_state(ContainerState::Stopped);
    }

    fn current_task(&self) -> Option<Arc<SubscriptionTask>> {
        self.current_task.lock().clone()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(ContainerError::Destroyed(self.config.name.clone()));
        }
        Ok(())
    }

    fn set_state(&self, state: ContainerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            tracing::debug!(
                "[{}] Container dropped without destroy(), cleaning up",
                self.config.name
            );
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for ListenerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContainer")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .field("topics", &self.registry.topics())
            .finish()
    }
}

/// Builder for [`ListenerContainer`].
///
/// Defaults:
/// - subscription executor: a [`ThreadExecutor`] named `{name}-subscription`, shut down by `destroy()`
/// - task executor: [`SyncExecutor`], listeners run on the receive thread
/// - error handler: [`LoggingErrorHandler`]
pub struct ContainerBuilder {
    provider: Arc<dyn ConnectionProvider>,
    config: ContainerConfig,
    subscription_executor: Option<Arc<dyn TaskExecutor>>,
    task_executor: Option<Arc<dyn TaskExecutor>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    bindings: Vec<(Arc<dyn MessageListener>, Vec<Topic>)>,
}

impl ContainerBuilder {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            config: ContainerConfig::default(),
            subscription_executor: None,
            task_executor: None,
            error_handler: None,
            bindings: Vec::new(),
        }
    }

    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Executor running the subscription task. Not shut down by the container.
    ///
    /// The task parks in `Connection::listen()`. For connections that block
    /// there, the executor must run the task on another thread: an inline
    /// executor such as [`SyncExecutor`] keeps `start()` inside `listen()`,
    /// past `max_subscription_registration_waiting_time`. `build()` logs a
    /// warning for inline executors.
    pub fn subscription_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.subscription_executor = Some(executor);
        self
    }

    /// Executor running listener invocations. Not shut down by the container.
    pub fn task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = Some(executor);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Register an initial binding
    pub fn listener<I>(mut self, listener: Arc<dyn MessageListener>, topics: I) -> Self
    where
        I: IntoIterator<Item = Topic>,
    {
        self.bindings.push((listener, topics.into_iter().collect()));
        self
    }

    /// Validate the configuration and assemble a stopped, ready-to-start container
    pub fn build(self) -> Result<ListenerContainer> {
        self.config.validate()?;

        let name = self.config.name.clone();
        let subscription_executor =
            ExecutorSlot::resolve(self.subscription_executor, || -> Arc<dyn TaskExecutor> {
                Arc::new(ThreadExecutor::new(format!("{}-subscription", name)))
            });
        if subscription_executor.executor.runs_inline() {
            tracing::warn!(
                "[{}] Subscription executor runs inline; start() blocks for as long as the connection listens",
                self.config.name
            );
        }
        let task_executor =
            ExecutorSlot::resolve(self.task_executor, || -> Arc<dyn TaskExecutor> {
                Arc::new(SyncExecutor)
            });
        let error_handler: Arc<dyn ErrorHandler> = match self.error_handler {
            Some(handler) => handler,
            None => Arc::new(LoggingErrorHandler),
        };

        let registry = Arc::new(ListenerRegistry::new());
        for (listener, topics) in self.bindings {
            registry.add(&listener, topics);
        }

        let sink: Arc<dyn MessageSink> = Arc::new(DispatchSink::new(
            Arc::clone(&registry),
            Arc::clone(&task_executor.executor),
            error_handler,
        ));

        tracing::debug!(
            "[{}] Container built with {} topic(s)",
            self.config.name,
            registry.topics().len()
        );

        Ok(ListenerContainer {
            config: self.config,
            provider: self.provider,
            registry,
            sink,
            subscription_executor,
            task_executor,
            state: AtomicU8::new(ContainerState::Stopped as u8),
            destroyed: AtomicBool::new(false),
            transition: Mutex::new(()),
            current_task: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Message};
    use crate::error::{ConnectionError, ConnectionResult};
    use crate::listener::listener_fn;
    use std::time::Duration;

    struct UnreachableBroker;

    impl ConnectionProvider for UnreachableBroker {
        fn get_connection(&self) -> ConnectionResult<Arc<dyn Connection>> {
            Err(ConnectionError::Unreachable("nowhere".to_string()))
        }
    }

    fn quick_config() -> ContainerConfig {
        ContainerConfig::fast_start()
            .with_name("unit")
            .with_max_subscription_registration_waiting_time(Duration::from_millis(100))
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Stopping,
        ] {
            assert_eq!(ContainerState::from_u8(state as u8), state);
        }
        assert_eq!(ContainerState::Running.to_string(), "running");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = ListenerContainer::new(
            Arc::new(UnreachableBroker),
            ContainerConfig::new().with_max_subscription_registration_waiting_time(Duration::ZERO),
        );
        assert!(matches!(result, Err(ContainerError::Configuration(_))));
    }

    #[test]
    fn test_builder_registers_initial_bindings() {
        let listener = listener_fn(|_: &Topic, _: &Message| Ok(()));
        let container = ListenerContainer::builder(Arc::new(UnreachableBroker))
            .config(quick_config())
            .listener(Arc::clone(&listener), [Topic::channel("a"), Topic::pattern("b*")])
            .build()
            .unwrap();

        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(
            container.registry().topics(),
            vec![Topic::channel("a"), Topic::pattern("b*")]
        );
    }

    #[test]
    fn test_unreachable_broker_start_times_out() {
        let container = ListenerContainer::builder(Arc::new(UnreachableBroker))
            .config(quick_config())
            .listener(listener_fn(|_, _| Ok(())), [Topic::channel("a")])
            .build()
            .unwrap();

        container.start().unwrap();
        assert!(!container.is_running());
        assert_eq!(container.state(), ContainerState::Stopped);
        container.destroy().unwrap();
    }

    #[test]
    fn test_inline_subscription_executor_blocks_start_until_task_returns() {
        let container = ListenerContainer::builder(Arc::new(UnreachableBroker))
            .config(quick_config().with_max_recovery_attempts(0))
            .subscription_executor(Arc::new(SyncExecutor))
            .listener(listener_fn(|_, _| Ok(())), [Topic::channel("a")])
            .build()
            .unwrap();
        assert!(container.subscription_executor.executor.runs_inline());

        // The task gives up on its first failure, handing the thread back.
        container.start().unwrap();
        assert!(!container.is_running());
        assert!(!container.is_listening());
    }

    #[test]
    fn test_start_without_topics_runs_idle() {
        let container = ListenerContainer::new(Arc::new(UnreachableBroker), quick_config()).unwrap();

        container.start().unwrap();
        assert!(container.is_running());
        assert!(!container.is_listening());

        container.stop();
        assert!(!container.is_running());
    }

    #[test]
    fn test_destroy_is_terminal() {
        let container = ListenerContainer::new(Arc::new(UnreachableBroker), quick_config()).unwrap();
        container.destroy().unwrap();

        assert!(container.is_destroyed());
        assert!(matches!(container.start(), Err(ContainerError::Destroyed(_))));
        assert!(matches!(container.destroy(), Err(ContainerError::Destroyed(_))));
        container.stop();
    }
}
