#![forbid(unsafe_code)]

//! Routes posted tasks to one of two independent lanes on the home thread.
//!
//! A [`HomePoster`] owns a sync (high-priority) and an async (normal) lane.
//! Each lane wakes the home loop with a callback that drains that lane and
//! no other, so the lanes never interleave within a single wake and each
//! keeps its own FIFO order. There is no global instance: posters are
//! constructed from a [`Looper`] handle and disposed explicitly, which keeps
//! tests and embedders free to run several isolated instances.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::dispatcher::{Dispatcher, DispatcherMetricsSnapshot, OfferError, DEFAULT_TIME_SLICE};
use crate::looper::{Looper, WakeError};
use crate::task::Task;

/// One of the two independent FIFO lanes feeding the home thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// High-priority lane for time-critical callers.
    Sync,
    /// Normal lane for ordinary work.
    Async,
}

/// Configuration for a [`HomePoster`].
#[derive(Debug, Clone)]
pub struct PosterConfig {
    /// Maximum wall-clock time one drain pass may consume before yielding
    /// back to the host loop.
    pub time_slice: Duration,
    /// Route both lanes through a single dispatcher, collapsing the
    /// priority distinction. Sync-lane FIFO still holds.
    pub merge_lanes: bool,
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            time_slice: DEFAULT_TIME_SLICE,
            merge_lanes: false,
        }
    }
}

/// Dual-lane task poster bound to one home loop.
pub struct HomePoster {
    sync_lane: Arc<Dispatcher>,
    async_lane: Arc<Dispatcher>,
    looper: Arc<dyn Looper>,
}

impl HomePoster {
    /// Creates a poster whose lanes wake the given loop.
    ///
    /// The wake closures hold only a weak reference back to the poster, so
    /// dropping the poster releases the loop registration without a cycle.
    #[must_use]
    pub fn new(looper: Arc<dyn Looper>, config: PosterConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HomePoster>| {
            let sync_lane = Arc::new(Dispatcher::new(
                config.time_slice,
                wake_fn(weak.clone(), looper.clone(), Lane::Sync),
            ));
            let async_lane = if config.merge_lanes {
                sync_lane.clone()
            } else {
                Arc::new(Dispatcher::new(
                    config.time_slice,
                    wake_fn(weak.clone(), looper.clone(), Lane::Async),
                ))
            };
            Self {
                sync_lane,
                async_lane,
                looper,
            }
        })
    }

    /// Offers `task` to the high-priority lane.
    ///
    /// # Errors
    ///
    /// Propagates [`OfferError`] when the lane is disposed or the home loop
    /// refuses the wake.
    pub fn post_sync(&self, task: Arc<Task>) -> Result<(), OfferError> {
        self.sync_lane.offer(task)
    }

    /// Offers `task` to the normal lane.
    ///
    /// # Errors
    ///
    /// Propagates [`OfferError`] when the lane is disposed or the home loop
    /// refuses the wake.
    pub fn post_async(&self, task: Arc<Task>) -> Result<(), OfferError> {
        self.async_lane.offer(task)
    }

    /// Drains the matching lane. Invoked by the home loop's wake handler;
    /// must only run on the home thread.
    pub fn drain(&self, lane: Lane) {
        match lane {
            Lane::Sync => self.sync_lane.drain(),
            Lane::Async => self.async_lane.drain(),
        }
    }

    /// Returns `true` when called from the home thread.
    #[must_use]
    pub fn is_home_thread(&self) -> bool {
        self.looper.is_home_thread()
    }

    /// Returns the given lane's counters.
    #[must_use]
    pub fn lane_metrics(&self, lane: Lane) -> DispatcherMetricsSnapshot {
        match lane {
            Lane::Sync => self.sync_lane.metrics(),
            Lane::Async => self.async_lane.metrics(),
        }
    }

    /// Disposes both lanes: pending tasks are discarded and the loop
    /// registration is dropped. Subsequent posts fail with
    /// [`OfferError::Disposed`].
    pub fn dispose(&self) {
        self.sync_lane.dispose();
        self.async_lane.dispose();
    }
}

fn wake_fn(
    poster: Weak<HomePoster>,
    looper: Arc<dyn Looper>,
    lane: Lane,
) -> impl Fn() -> Result<(), WakeError> + Send + Sync + 'static {
    move || {
        let poster = poster.clone();
        looper.execute(Box::new(move || {
            if let Some(poster) = poster.upgrade() {
                poster.drain(lane);
            }
        }))
    }
}
