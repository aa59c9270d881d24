#![forbid(unsafe_code)]

//! Single-lane pending queue with time-sliced draining.
//!
//! Each [`Dispatcher`] owns one FIFO pending queue, an `active` flag, and a
//! wake callback. Any thread may [`offer`](Dispatcher::offer); only the home
//! thread [`drain`](Dispatcher::drain)s. The queue, the flag, and the wake
//! callback share one mutex, held only for queue mutation and flag
//! transitions, never across task execution, so a slow task delays draining
//! but never blocks new offers.
//!
//! Draining is bounded by a wall-clock time slice. A backlog that exceeds
//! the slice is spread across multiple host-loop passes: the drain re-arms
//! its own wake and returns, handing control back to whatever else the home
//! thread needs to do. This is the fairness mechanism that keeps a burst of
//! cheap tasks from monopolising the loop.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::looper::WakeError;
use crate::task::{PendingQueue, Task};

#[cfg(feature = "tracing")]
use tracing::{debug, error};

/// Default wall-clock budget for one drain pass (one 60 Hz frame).
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(16);

type WakeFn = Box<dyn Fn() -> Result<(), WakeError> + Send + Sync>;

/// Errors raised by [`Dispatcher::offer`].
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    /// The dispatcher was disposed; offering to it is a programming error.
    #[error("dispatcher has been disposed")]
    Disposed,

    /// The home loop refused the wake; the task was not enqueued.
    #[error("failed to wake the home loop: {0}")]
    Wake(#[from] WakeError),
}

/// Counters for one lane, updated lock-free alongside queue operations.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Tasks accepted by `offer`.
    pub tasks_offered: AtomicU64,
    /// Tasks executed by `drain`.
    pub tasks_executed: AtomicU64,
    /// Tasks removed from the queue by cancellation.
    pub tasks_removed: AtomicU64,
    /// Tasks whose body panicked during `drain`.
    pub tasks_panicked: AtomicU64,
    /// `drain` invocations.
    pub drains: AtomicU64,
    /// Drains that ran out of time slice and re-armed the wake.
    pub reschedules: AtomicU64,
}

impl DispatcherMetrics {
    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            tasks_offered: self.tasks_offered.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_removed: self.tasks_removed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`DispatcherMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherMetricsSnapshot {
    /// Tasks accepted by `offer`.
    pub tasks_offered: u64,
    /// Tasks executed by `drain`.
    pub tasks_executed: u64,
    /// Tasks removed from the queue by cancellation.
    pub tasks_removed: u64,
    /// Tasks whose body panicked during `drain`.
    pub tasks_panicked: u64,
    /// `drain` invocations.
    pub drains: u64,
    /// Drains that ran out of time slice and re-armed the wake.
    pub reschedules: u64,
}

struct PendingInner {
    queue: VecDeque<Arc<Task>>,
    /// True iff a wake is outstanding or a drain is in progress.
    active: bool,
    wake: Option<WakeFn>,
    disposed: bool,
}

/// Shared lane state; the back-reference target for task cancellation.
struct Pending {
    inner: Mutex<PendingInner>,
    metrics: Arc<DispatcherMetrics>,
}

impl PendingQueue for Pending {
    fn remove(&self, task: &Task) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.queue.len();
        inner
            .queue
            .retain(|queued| !std::ptr::eq(Arc::as_ptr(queued), task));
        let removed = inner.queue.len() != before;
        if removed {
            self.metrics.tasks_removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }
}

/// One priority lane: pending queue, active flag, and drain loop.
pub struct Dispatcher {
    shared: Arc<Pending>,
    time_slice: Duration,
}

impl Dispatcher {
    /// Creates a lane with the given drain time slice and wake callback.
    ///
    /// The wake callback is invoked at most once per idle-to-active
    /// transition and once per over-budget drain; it must be cheap and
    /// callable from any thread.
    #[must_use]
    pub fn new(
        time_slice: Duration,
        wake: impl Fn() -> Result<(), WakeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Pending {
                inner: Mutex::new(PendingInner {
                    queue: VecDeque::new(),
                    active: false,
                    wake: Some(Box::new(wake)),
                    disposed: false,
                }),
                metrics: Arc::new(DispatcherMetrics::default()),
            }),
            time_slice,
        }
    }

    /// Appends `task` to the pending queue and wakes the home loop if the
    /// lane was idle.
    ///
    /// Multiple offers while the lane is already active do not re-wake.
    ///
    /// # Errors
    ///
    /// Returns [`OfferError::Disposed`] after [`dispose`](Self::dispose),
    /// and [`OfferError::Wake`] when the home loop refuses the wake — in
    /// that case the task is rolled back off the queue rather than silently
    /// stranded.
    pub fn offer(&self, task: Arc<Task>) -> Result<(), OfferError> {
        let mut inner = self.shared.inner.lock();
        if inner.disposed {
            return Err(OfferError::Disposed);
        }

        let queue: Arc<dyn PendingQueue> = self.shared.clone();
        task.attach(Arc::downgrade(&queue));
        inner.queue.push_back(task);

        if !inner.active {
            inner.active = true;
            let woke = match inner.wake.as_ref() {
                Some(wake) => wake(),
                None => Err(WakeError::LoopClosed),
            };
            if let Err(err) = woke {
                inner.active = false;
                inner.queue.pop_back();
                return Err(err.into());
            }
        }

        self.shared
            .metrics
            .tasks_offered
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops and executes pending tasks until the queue empties or the time
    /// slice is exceeded.
    ///
    /// Must only be invoked from the home thread. Task panics are caught
    /// and counted; the lane keeps draining. When the slice runs out with
    /// work remaining, the wake is re-armed and control returns to the host
    /// loop; the backlog is finished on later passes.
    pub fn drain(&self) {
        let metrics = &self.shared.metrics;
        metrics.drains.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        loop {
            let task = match self.poll() {
                Some(task) => task,
                None => {
                    // Re-check under the lock so the idle transition cannot
                    // race an offer that just observed `active == true`.
                    let mut inner = self.shared.inner.lock();
                    match inner.queue.pop_front() {
                        Some(task) => task,
                        None => {
                            inner.active = false;
                            return;
                        }
                    }
                }
            };

            if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                metrics.tasks_panicked.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                error!("task panicked during drain; lane continues");
            } else {
                metrics.tasks_executed.fetch_add(1, Ordering::Relaxed);
            }

            if started.elapsed() >= self.time_slice {
                self.reschedule();
                return;
            }
        }
    }

    /// Clears the pending queue and drops the wake callback.
    ///
    /// Queued tasks are discarded without running. Subsequent offers fail
    /// with [`OfferError::Disposed`].
    pub fn dispose(&self) {
        let mut inner = self.shared.inner.lock();
        inner.queue.clear();
        inner.wake = None;
        inner.active = false;
        inner.disposed = true;
    }

    /// Returns this lane's counters.
    #[must_use]
    pub fn metrics(&self) -> DispatcherMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Current number of tasks waiting in the lane.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    fn poll(&self) -> Option<Arc<Task>> {
        self.shared.inner.lock().queue.pop_front()
    }

    /// Over-budget exit: leave the lane active and ask the loop for another
    /// pass.
    fn reschedule(&self) {
        let mut inner = self.shared.inner.lock();
        let woke = match inner.wake.as_ref() {
            Some(wake) => wake(),
            None => return, // disposed mid-drain
        };
        match woke {
            Ok(()) => {
                self.shared
                    .metrics
                    .reschedules
                    .fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                debug!(pending = inner.queue.len(), "time slice exceeded, drain rescheduled");
            }
            Err(_err) => {
                // Let a later offer retry the wake instead of wedging the
                // lane in a permanently-active state.
                inner.active = false;
                #[cfg(feature = "tracing")]
                error!(error = %_err, pending = inner.queue.len(), "failed to re-arm drain");
            }
        }
    }
}
