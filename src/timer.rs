#![forbid(unsafe_code)]

//! Monotonic-deadline timer thread for delayed and periodic work.
//!
//! One dedicated thread sleeps on a condition variable until the earliest
//! deadline in a min-heap, then fires the entry outside the lock. Periodic
//! entries re-insert themselves at `deadline + period`, keeping a steady
//! cadence independent of how long the callback took. Callbacks here are
//! expected to be cheap — the façade layer uses them to post tasks to a
//! lane or the background pool, never to run user work on the timer thread
//! itself.

use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::task::Work;

#[cfg(feature = "tracing")]
use tracing::error;

/// Cancellation handle for a scheduled timer entry.
///
/// Cancellation is observed when the entry's deadline is reached: a
/// cancelled one-shot is dropped, a cancelled repeating entry fires its
/// cancel callback instead of the next tick.
#[derive(Debug, Default)]
pub struct TimerHandle {
    cancelled: AtomicBool,
}

impl TimerHandle {
    /// Marks the entry cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum EntryKind {
    Once(Option<Work>),
    Repeat {
        period: Duration,
        /// `None` repeats until cancelled.
        times: Option<u32>,
        index: u32,
        on_tick: Box<dyn FnMut(u32) + Send>,
        /// Fired one period after the final tick, matching the cadence of
        /// the ticks themselves.
        on_finish: Option<Work>,
        on_cancel: Option<Work>,
    },
}

struct Entry {
    deadline: Instant,
    seq: u64,
    handle: Arc<TimerHandle>,
    kind: EntryKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Reversed so `BinaryHeap` pops the earliest deadline first; `seq`
    /// breaks ties in insertion order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerInner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    stopped: bool,
}

struct TimerShared {
    inner: Mutex<TimerInner>,
    cond: Condvar,
}

/// Dedicated timer thread with a deadline heap.
pub struct Timer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Spawns the timer thread under the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(TimerShared {
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&thread_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Schedules `work` to fire once at `deadline`.
    pub fn schedule_once(
        &self,
        deadline: Instant,
        work: impl FnOnce() + Send + 'static,
    ) -> Arc<TimerHandle> {
        self.schedule(|handle| Entry {
            deadline,
            seq: 0,
            handle,
            kind: EntryKind::Once(Some(Box::new(work))),
        })
    }

    /// Schedules `on_tick(index)` at `first`, then every `period`.
    ///
    /// With `times = Some(n)` the entry ticks indices `0..n` and fires
    /// `on_finish` one period after the last tick; with `None` it repeats
    /// until cancelled. A cancelled entry fires `on_cancel` at its next
    /// deadline instead of ticking.
    pub fn schedule_repeat(
        &self,
        first: Instant,
        period: Duration,
        times: Option<u32>,
        on_tick: impl FnMut(u32) + Send + 'static,
        on_finish: Option<Work>,
        on_cancel: Option<Work>,
    ) -> Arc<TimerHandle> {
        self.schedule(|handle| Entry {
            deadline: first,
            seq: 0,
            handle,
            kind: EntryKind::Repeat {
                period,
                times,
                index: 0,
                on_tick: Box::new(on_tick),
                on_finish,
                on_cancel,
            },
        })
    }

    /// Stops the timer thread. Entries not yet due are discarded.
    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.stopped = true;
            inner.heap.clear();
        }
        self.shared.cond.notify_all();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn schedule(&self, build: impl FnOnce(Arc<TimerHandle>) -> Entry) -> Arc<TimerHandle> {
        let handle = Arc::new(TimerHandle::default());
        {
            let mut inner = self.shared.inner.lock();
            let mut entry = build(handle.clone());
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(entry);
        }
        self.shared.cond.notify_all();
        handle
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &TimerShared) {
    loop {
        let mut inner = shared.inner.lock();
        if inner.stopped {
            break;
        }

        let next_deadline = inner.heap.peek().map(|entry| entry.deadline);
        match next_deadline {
            None => {
                shared.cond.wait(&mut inner);
            }
            Some(deadline) if deadline > Instant::now() => {
                let _ = shared.cond.wait_until(&mut inner, deadline);
            }
            Some(_) => {
                if let Some(entry) = inner.heap.pop() {
                    drop(inner);
                    // Fire outside the lock so new entries can be scheduled
                    // while callbacks run.
                    if let Some(reinsert) = fire(entry) {
                        shared.inner.lock().heap.push(reinsert);
                    }
                }
            }
        }
    }
}

enum After {
    Done,
    Reinsert,
}

fn fire(mut entry: Entry) -> Option<Entry> {
    if entry.handle.is_cancelled() {
        if let EntryKind::Repeat { on_cancel, .. } = &mut entry.kind {
            if let Some(cancel) = on_cancel.take() {
                run_guarded(cancel);
            }
        }
        return None;
    }

    let after = match &mut entry.kind {
        EntryKind::Once(work) => {
            if let Some(work) = work.take() {
                run_guarded(work);
            }
            After::Done
        }
        EntryKind::Repeat {
            period,
            times,
            index,
            on_tick,
            on_finish,
            ..
        } => {
            if times.is_some_and(|t| *index >= t) {
                if let Some(finish) = on_finish.take() {
                    run_guarded(finish);
                }
                After::Done
            } else {
                let i = *index;
                if catch_unwind(AssertUnwindSafe(|| on_tick(i))).is_err() {
                    #[cfg(feature = "tracing")]
                    error!(index = i, "timer tick callback panicked");
                }
                *index += 1;
                let period = *period;
                entry.deadline += period;
                After::Reinsert
            }
        }
    };

    match after {
        After::Done => None,
        After::Reinsert => Some(entry),
    }
}

fn run_guarded(work: Work) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        #[cfg(feature = "tracing")]
        error!("timer callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let limit = Instant::now() + deadline;
        while Instant::now() < limit {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn one_shot_fires_at_its_deadline() {
        let timer = Timer::new("timer-test");
        let fired = Arc::new(AtomicU32::new(0));

        let probe = fired.clone();
        let start = Instant::now();
        timer.schedule_once(start + Duration::from_millis(20), move || {
            probe.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn earlier_entry_preempts_a_later_one() {
        let timer = Timer::new("timer-test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let now = Instant::now();
        let late = log.clone();
        timer.schedule_once(now + Duration::from_millis(80), move || {
            late.lock().push("late");
        });
        let early = log.clone();
        timer.schedule_once(now + Duration::from_millis(10), move || {
            early.lock().push("early");
        });

        assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 2));
        assert_eq!(*log.lock(), vec!["early", "late"]);
    }

    #[test]
    fn cancelled_one_shot_never_fires() {
        let timer = Timer::new("timer-test");
        let fired = Arc::new(AtomicU32::new(0));

        let probe = fired.clone();
        let handle = timer.schedule_once(Instant::now() + Duration::from_millis(30), move || {
            probe.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeat_ticks_in_order_then_finishes() {
        let timer = Timer::new("timer-test");
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicU32::new(0));

        let tick_log = ticks.clone();
        let finish_probe = finished.clone();
        timer.schedule_repeat(
            Instant::now(),
            Duration::from_millis(10),
            Some(3),
            move |i| tick_log.lock().push(i),
            Some(Box::new(move || {
                finish_probe.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );

        assert!(wait_until(Duration::from_secs(2), || {
            finished.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(*ticks.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_repeat_fires_cancel_instead_of_ticking() {
        let timer = Timer::new("timer-test");
        let ticks = Arc::new(AtomicU32::new(0));
        let cancelled = Arc::new(AtomicU32::new(0));

        let tick_probe = ticks.clone();
        let cancel_probe = cancelled.clone();
        let handle = timer.schedule_repeat(
            Instant::now() + Duration::from_millis(5),
            Duration::from_millis(5),
            None,
            move |_| {
                tick_probe.fetch_add(1, Ordering::SeqCst);
            },
            None,
            Some(Box::new(move || {
                cancel_probe.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(wait_until(Duration::from_secs(2), || {
            ticks.load(Ordering::SeqCst) >= 2
        }));
        handle.cancel();

        assert!(wait_until(Duration::from_secs(2), || {
            cancelled.load(Ordering::SeqCst) == 1
        }));
        let after_cancel = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn shutdown_discards_pending_entries() {
        let timer = Timer::new("timer-test");
        let fired = Arc::new(AtomicU32::new(0));

        let probe = fired.clone();
        timer.schedule_once(Instant::now() + Duration::from_millis(30), move || {
            probe.fetch_add(1, Ordering::SeqCst);
        });
        timer.shutdown();

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
