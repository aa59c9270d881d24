#![forbid(unsafe_code)]

//! One-stop façade over the home loop, both lanes, the background pool, and
//! the timer.
//!
//! [`Run`] owns one of each and exposes the operations most callers want:
//! post now, post later, post at an absolute time, block on a cross-thread
//! call, and drive a periodic observer. Everything returns a cancellable
//! [`Task`] or [`TimerHandle`], and [`Run::dispose`] tears the whole stack
//! down in dependency order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::{BackgroundPool, PoolConfig, PoolMetricsSnapshot, SubmitError};
use crate::blocking::{BlockingCall, TimeoutPolicy};
use crate::dispatcher::{DispatcherMetricsSnapshot, OfferError, DEFAULT_TIME_SLICE};
use crate::looper::{Looper, ThreadLooper};
use crate::poster::{HomePoster, Lane, PosterConfig};
use crate::task::Task;
use crate::timer::{Timer, TimerHandle};

#[cfg(feature = "tracing")]
use tracing::warn;

/// Destination for posted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Home thread, high-priority lane.
    HomeSync,
    /// Home thread, normal lane.
    HomeAsync,
    /// Background worker pool.
    Background,
}

/// Configuration for a [`Run`] instance.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Per-drain wall-clock budget for each home lane.
    pub time_slice: Duration,
    /// Collapse both home lanes into one queue.
    pub merge_lanes: bool,
    /// Background pool sizing.
    pub background: PoolConfig,
    /// Name of the home loop thread.
    pub home_thread_name: String,
    /// Name of the timer thread.
    pub timer_thread_name: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            time_slice: DEFAULT_TIME_SLICE,
            merge_lanes: false,
            background: PoolConfig::default(),
            home_thread_name: "homepost-home".to_string(),
            timer_thread_name: "homepost-timer".to_string(),
        }
    }
}

/// Errors raised by the posting operations.
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    /// The home lane refused the task.
    #[error(transparent)]
    Offer(#[from] OfferError),

    /// The background pool refused the job.
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Receiver for the lifecycle of a periodic schedule.
///
/// All three callbacks are delivered on the [`Target`] the interval was
/// started with, never on the timer thread.
pub trait IntervalObserver: Send + Sync {
    /// Called once per period with the zero-based tick index.
    fn tick(&self, index: u32);

    /// Called one period after the final tick of a finite schedule.
    fn finish(&self) {}

    /// Called once after the schedule was cancelled.
    fn cancel(&self) {}
}

/// Plain closures observe ticks and ignore the lifecycle callbacks.
impl<F: Fn(u32) + Send + Sync> IntervalObserver for F {
    fn tick(&self, index: u32) {
        self(index);
    }
}

/// Owns the home loop, both lanes, the background pool, and the timer.
pub struct Run {
    looper: Arc<ThreadLooper>,
    poster: Arc<HomePoster>,
    pool: Arc<BackgroundPool>,
    timer: Timer,
    disposed: AtomicBool,
}

impl Run {
    /// Builds the full stack from `config`, spawning the home loop, the
    /// worker pool, and the timer thread.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        let looper = Arc::new(ThreadLooper::new(&config.home_thread_name));
        let poster = HomePoster::new(
            looper.clone(),
            PosterConfig {
                time_slice: config.time_slice,
                merge_lanes: config.merge_lanes,
            },
        );
        let pool = Arc::new(BackgroundPool::new(config.background));
        let timer = Timer::new(&config.timer_thread_name);

        Self {
            looper,
            poster,
            pool,
            timer,
            disposed: AtomicBool::new(false),
        }
    }

    /// Posts `work` to `target` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PostError`] when the destination refuses the task.
    pub fn post(
        &self,
        target: Target,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Task>, PostError> {
        let task = Task::new(work);
        route(&self.poster, &self.pool, target, task.clone())?;
        Ok(task)
    }

    /// Posts `work` to `target` after `delay`.
    ///
    /// The returned task can be cancelled at any point before it runs; a
    /// cancelled task is skipped when its deadline fires.
    pub fn post_later(
        &self,
        target: Target,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Arc<Task> {
        self.post_at(target, Instant::now() + delay, work)
    }

    /// Posts `work` to `target` at the absolute instant `at`.
    ///
    /// A deadline already in the past fires on the timer's next pass. If the
    /// destination has shut down by the time the deadline arrives, the task
    /// is dropped and the failure is logged rather than surfaced.
    pub fn post_at(
        &self,
        target: Target,
        at: Instant,
        work: impl FnOnce() + Send + 'static,
    ) -> Arc<Task> {
        let task = Task::new(work);

        let poster = self.poster.clone();
        let pool = self.pool.clone();
        let timed = task.clone();
        self.timer.schedule_once(at, move || {
            if timed.is_done() {
                return;
            }
            route_or_log(&poster, &pool, target, timed);
        });

        task
    }

    /// Runs `func` on the home thread and blocks until its value arrives.
    ///
    /// Called from the home thread itself, the closure runs inline to avoid
    /// deadlocking on the lane that the caller is currently draining.
    ///
    /// # Errors
    ///
    /// Returns [`PostError`] when the sync lane refuses the task.
    pub fn call<T: Send + 'static>(
        &self,
        func: impl FnOnce() -> T + Send + 'static,
    ) -> Result<T, PostError> {
        if self.looper.is_home_thread() {
            return Ok(func());
        }
        let call = BlockingCall::new(func);
        self.poster.post_sync(call.task())?;
        Ok(call.wait())
    }

    /// Bounded variant of [`call`](Self::call): waits at most `timeout` and
    /// returns `None` on expiry. `policy` decides whether the still-queued
    /// task is cancelled or left to run late.
    ///
    /// # Errors
    ///
    /// Returns [`PostError`] when the sync lane refuses the task.
    pub fn call_timeout<T: Send + 'static>(
        &self,
        func: impl FnOnce() -> T + Send + 'static,
        timeout: Duration,
        policy: TimeoutPolicy,
    ) -> Result<Option<T>, PostError> {
        if self.looper.is_home_thread() {
            return Ok(Some(func()));
        }
        let call = BlockingCall::new(func);
        self.poster.post_sync(call.task())?;
        Ok(call.wait_timeout(timeout, policy))
    }

    /// Starts a periodic schedule delivering to `observer` on `target`.
    ///
    /// The first tick fires after `first_delay`, subsequent ticks every
    /// `period`. With `times = Some(n)` the observer sees ticks `0..n`
    /// followed by `finish` one period later; with `None` it ticks until the
    /// returned handle is cancelled, after which `cancel` is delivered once.
    pub fn interval(
        &self,
        target: Target,
        first_delay: Duration,
        period: Duration,
        times: Option<u32>,
        observer: Arc<dyn IntervalObserver>,
    ) -> Arc<TimerHandle> {
        let poster = self.poster.clone();
        let pool = self.pool.clone();

        let tick = {
            let poster = poster.clone();
            let pool = pool.clone();
            let observer = observer.clone();
            move |index: u32| {
                let observer = observer.clone();
                let task = Task::new(move || observer.tick(index));
                route_or_log(&poster, &pool, target, task);
            }
        };
        let finish = {
            let poster = poster.clone();
            let pool = pool.clone();
            let observer = observer.clone();
            Box::new(move || {
                let task = Task::new(move || observer.finish());
                route_or_log(&poster, &pool, target, task);
            }) as Box<dyn FnOnce() + Send>
        };
        let cancel = Box::new(move || {
            let task = Task::new(move || observer.cancel());
            route_or_log(&poster, &pool, target, task);
        }) as Box<dyn FnOnce() + Send>;

        self.timer.schedule_repeat(
            Instant::now() + first_delay,
            period,
            times,
            tick,
            Some(finish),
            Some(cancel),
        )
    }

    /// Returns `true` when called from the home thread.
    #[must_use]
    pub fn is_home_thread(&self) -> bool {
        self.looper.is_home_thread()
    }

    /// Returns the given home lane's counters.
    #[must_use]
    pub fn lane_metrics(&self, lane: Lane) -> DispatcherMetricsSnapshot {
        self.poster.lane_metrics(lane)
    }

    /// Returns the background pool's counters.
    #[must_use]
    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }

    /// Tears the stack down: timer first so nothing new is scheduled, then
    /// the pool, the lanes, and finally the home loop.
    ///
    /// Idempotent. Must not be called from the home thread, as it joins the
    /// loop thread. Unbounded [`call`](Self::call) waiters on other threads
    /// are not released by disposal.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.shutdown();
        self.pool.shutdown();
        self.poster.dispose();
        self.looper.shutdown();
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn route(
    poster: &Arc<HomePoster>,
    pool: &Arc<BackgroundPool>,
    target: Target,
    task: Arc<Task>,
) -> Result<(), PostError> {
    match target {
        Target::HomeSync => poster.post_sync(task)?,
        Target::HomeAsync => poster.post_async(task)?,
        Target::Background => pool.submit(Box::new(move || task.run()))?,
    }
    Ok(())
}

fn route_or_log(
    poster: &Arc<HomePoster>,
    pool: &Arc<BackgroundPool>,
    target: Target,
    task: Arc<Task>,
) {
    if let Err(error) = route(poster, pool, target, task) {
        #[cfg(feature = "tracing")]
        warn!(%error, destination = ?target, "timed task dropped, destination unavailable");
        #[cfg(not(feature = "tracing"))]
        let _ = error;
    }
}
