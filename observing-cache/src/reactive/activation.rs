//! Lazy Activation
//!
//! An `Activation` is a one-time hook shared by a group of signals. Readers
//! call [`Activation::trigger`] at the top of their accessor; the first call
//! runs the hook, every later call is a no-op.
//!
//! A hook that fails leaves the guard armed, so the next read retries it.
//! Re-entrant triggers (a hook that ends up reading one of its own signals)
//! return immediately instead of running the hook twice. Triggers from other
//! threads wait for the running hook to finish, and run it themselves if it
//! failed.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

type Hook<E> = Box<dyn Fn() -> Result<(), E> + Send + Sync>;

/// Where the guard is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// The hook has not run yet (or its last run failed).
    Armed,

    /// The hook is running right now.
    Running,

    /// The hook completed successfully.
    Done,
}

/// A hook that runs at most once successfully, on first access.
pub struct Activation<E> {
    slot: Mutex<Slot>,
    finished: Condvar,
    hook: Hook<E>,
}

struct Slot {
    state: ActivationState,
    /// Thread running the hook while `state` is `Running`.
    runner: Option<ThreadId>,
}

/// Settles the slot when the hook returns or unwinds.
struct RunGuard<'a, E> {
    activation: &'a Activation<E>,
    done: bool,
}

impl<E> Drop for RunGuard<'_, E> {
    fn drop(&mut self) {
        {
            let mut slot = self.activation.slot.lock();
            slot.state = if self.done {
                ActivationState::Done
            } else {
                ActivationState::Armed
            };
            slot.runner = None;
        }
        self.activation.finished.notify_all();
    }
}

impl<E> Activation<E> {
    /// Arm a new guard around `hook`.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
    {
        Self {
            slot: Mutex::new(Slot {
                state: ActivationState::Armed,
                runner: None,
            }),
            finished: Condvar::new(),
            hook: Box::new(hook),
        }
    }

    /// Run the hook if it has not completed yet.
    ///
    /// The state lock is released while the hook runs. If another thread is
    /// running the hook, this blocks until it returns.
    pub fn trigger(&self) -> Result<(), E> {
        let me = thread::current().id();
        {
            let mut slot = self.slot.lock();
            loop {
                let (state, runner) = (slot.state, slot.runner);
                match state {
                    ActivationState::Done => return Ok(()),
                    ActivationState::Running if runner == Some(me) => return Ok(()),
                    ActivationState::Running => self.finished.wait(&mut slot),
                    ActivationState::Armed => break,
                }
            }
            slot.state = ActivationState::Running;
            slot.runner = Some(me);
        }

        let mut guard = RunGuard {
            activation: self,
            done: false,
        };
        let outcome = (self.hook)();
        guard.done = outcome.is_ok();
        drop(guard);

        outcome
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ActivationState {
        self.slot.lock().state
    }

    /// Whether the hook has started or completed.
    pub fn is_triggered(&self) -> bool {
        self.state() != ActivationState::Armed
    }
}

impl<E> std::fmt::Debug for Activation<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("state", &self.state())
            .finish()
    }
}
