//! Execution contexts
//!
//! The container hands work to a [`TaskExecutor`] instead of spawning threads
//! itself: the subscription task runs on the *subscription executor* and each
//! listener invocation on the *task executor*. Tests plug in inline or
//! recording executors to control interleaving without real concurrency.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::ExecutorError;

/// A unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted work on some thread, synchronously or asynchronously
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;

    /// Stop accepting work and release held resources
    fn shutdown(&self) {}

    /// Whether `execute` returns only after the task has finished
    fn runs_inline(&self) -> bool {
        false
    }
}

/// Runs every task inline on the submitting thread
///
/// Fine as a task executor. As a subscription executor it only suits
/// connections whose `listen()` returns right away: with a blocking
/// connection `start()` would not return until the connection ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncExecutor;

impl TaskExecutor for SyncExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        task();
        Ok(())
    }

    fn runs_inline(&self) -> bool {
        true
    }
}

/// Spawns a named thread per task
pub struct ThreadExecutor {
    name_prefix: String,
    counter: AtomicU64,
    shut_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadExecutor {
    /// Create an executor whose threads are named `{prefix}-{n}`
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            counter: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of spawned threads that have not been reaped yet
    pub fn active_workers(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl TaskExecutor for ThreadExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        if self.is_shut_down() {
            return Err(ExecutorError::Rejected(format!(
                "executor '{}' is shut down",
                self.name_prefix
            )));
        }

        let name = format!(
            "{}-{}",
            self.name_prefix,
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        let handle = thread::Builder::new().name(name).spawn(task)?;

        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let mut detached = 0;
        for handle in workers {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("Worker thread of '{}' panicked", self.name_prefix);
                }
            } else {
                detached += 1;
            }
        }

        if detached > 0 {
            tracing::warn!(
                "Executor '{}' shut down with {} worker(s) still running",
                self.name_prefix,
                detached
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_sync_executor_runs_inline() {
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        SyncExecutor
            .execute(Box::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller);
        assert!(SyncExecutor.runs_inline());
    }

    #[test]
    fn test_thread_executor_names_threads() {
        let executor = ThreadExecutor::new("unit-exec");
        let (tx, rx) = mpsc::channel();
        executor
            .execute(Box::new(move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
            }))
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("unit-exec-1"));
        assert!(!executor.runs_inline());
    }

    #[test]
    fn test_thread_executor_rejects_after_shutdown() {
        let executor = ThreadExecutor::new("unit-exec");
        executor.shutdown();
        assert!(executor.is_shut_down());

        let result = executor.execute(Box::new(|| {}));
        assert!(matches!(result, Err(ExecutorError::Rejected(_))));
        assert_eq!(executor.active_workers(), 0);
    }
}
