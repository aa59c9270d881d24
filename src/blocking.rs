#![forbid(unsafe_code)]

//! Blocking cross-thread call bridge.
//!
//! A [`BlockingCall`] pairs a value-producing closure with a tri-state
//! result slot guarded by a mutex and condition variable. The closure is
//! wrapped in a [`Task`] that can be posted to a lane; the calling thread
//! then parks on the slot's own monitor (never on a dispatcher lock) until
//! the home thread stores the value, or the wait times out.
//!
//! On timeout the slot is marked abandoned under the lock before anything
//! else happens, so a home-thread execution that loses the race can never
//! store a result the caller already gave up on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::task::Task;

/// What to do with the queued task when a bounded wait times out.
///
/// There is no default on purpose: call sites legitimately want either
/// behavior, so every bounded wait states its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Mark the task done and remove it from its lane; a late drain will
    /// not execute the body.
    CancelTask,
    /// Leave the task queued; the body still runs for its side effects, but
    /// the result is discarded.
    LetTaskRun,
}

enum SlotState<T> {
    Pending,
    Ready(T),
    /// The caller stopped waiting; late results are dropped.
    Abandoned,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

/// A value-producing task plus the monitor its caller waits on.
pub struct BlockingCall<T> {
    slot: Arc<Slot<T>>,
    task: Arc<Task>,
}

impl<T: Send + 'static> BlockingCall<T> {
    /// Wraps `func` so its result can be awaited across threads.
    #[must_use]
    pub fn new(func: impl FnOnce() -> T + Send + 'static) -> Self {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        });

        let store = slot.clone();
        let task = Task::new(move || {
            let value = func();
            let mut state = store.state.lock();
            if matches!(*state, SlotState::Pending) {
                *state = SlotState::Ready(value);
                store.ready.notify_all();
            }
        });

        Self { slot, task }
    }

    /// The task to post to a lane. Executing it (exactly once) fulfils the
    /// call.
    #[must_use]
    pub fn task(&self) -> Arc<Task> {
        self.task.clone()
    }

    /// Blocks until the home thread has produced the value.
    ///
    /// No timeout: if the task is cancelled out from under the call (for
    /// example by lane disposal) this waits forever, which is the contract
    /// the caller chose by using the unbounded form.
    #[must_use]
    pub fn wait(self) -> T {
        let mut state = self.slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Abandoned) {
                SlotState::Ready(value) => return value,
                other => {
                    *state = other;
                    self.slot.ready.wait(&mut state);
                }
            }
        }
    }

    /// Blocks at most `timeout`, returning `None` on expiry.
    ///
    /// Timeout is a normal absence, not an error, and never interrupts a
    /// body already mid-execution on the home thread. `policy` decides
    /// whether the still-queued task is cancelled or left to run late.
    #[must_use]
    pub fn wait_timeout(self, timeout: Duration, policy: TimeoutPolicy) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();

        while matches!(*state, SlotState::Pending) {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        match std::mem::replace(&mut *state, SlotState::Abandoned) {
            SlotState::Ready(value) => Some(value),
            _ => {
                drop(state);
                if policy == TimeoutPolicy::CancelTask {
                    self.task.cancel();
                }
                None
            }
        }
    }
}
