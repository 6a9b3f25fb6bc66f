//! Cooperative thread interruption
//!
//! Every thread owns an interrupt flag. Another thread can set it through an
//! [`Interrupter`] obtained from [`current()`]; a thread parked in
//! [`ListenerContainer::start`](crate::ListenerContainer::start) is woken
//! immediately and abandons the start.
//!
//! The flag stays set until the owning thread clears it with [`interrupted()`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct InterruptState {
    flag: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState::default());
}

/// Handle to one thread's interrupt flag
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// Set the flag and wake the thread if it is parked in an interruptible wait
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        if let Some(waker) = self.state.waker.lock().as_ref() {
            waker();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Interrupter for the calling thread
pub fn current() -> Interrupter {
    CURRENT.with(|state| Interrupter {
        state: Arc::clone(state),
    })
}

/// Test and clear the calling thread's interrupt flag
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.flag.swap(false, Ordering::SeqCst))
}

/// Read the calling thread's interrupt flag without clearing it
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.flag.load(Ordering::SeqCst))
}

/// Registration of a wake-up callback for the calling thread.
///
/// The callback runs whenever the thread is interrupted while the guard lives.
pub(crate) struct WakeRegistration {
    state: Arc<InterruptState>,
}

pub(crate) fn on_interrupt(waker: impl Fn() + Send + Sync + 'static) -> WakeRegistration {
    let state = CURRENT.with(Arc::clone);
    *state.waker.lock() = Some(Arc::new(waker));
    WakeRegistration { state }
}

impl Drop for WakeRegistration {
    fn drop(&mut self) {
        self.state.waker.lock().take();
    }
}
