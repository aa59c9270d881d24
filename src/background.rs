#![forbid(unsafe_code)]

//! Fixed pool of background worker threads.
//!
//! Work that must not touch the home thread goes here: a bounded submission
//! channel feeding named worker threads. Jobs are isolated from each other —
//! a panicking job is counted and logged, and its worker keeps serving the
//! queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::task::Work;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info};

/// Configuration for the background pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Maximum jobs waiting in the submission queue.
    pub max_queue_size: usize,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpu_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

        Self {
            threads: (cpu_count / 2).clamp(2, 8),
            max_queue_size: 1024,
            thread_name_prefix: "homepost-worker".to_string(),
        }
    }
}

/// Errors raised by [`BackgroundPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The submission queue is at capacity.
    #[error("background queue is full")]
    QueueFull,

    /// The pool is shutting down and accepts no further jobs.
    #[error("background pool is shutting down")]
    ShuttingDown,
}

/// Counters for the background pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Jobs accepted by `submit`.
    pub jobs_submitted: AtomicU64,
    /// Jobs run to completion.
    pub jobs_completed: AtomicU64,
    /// Jobs rejected by a full queue.
    pub jobs_rejected: AtomicU64,
    /// Jobs that panicked.
    pub jobs_panicked: AtomicU64,
    /// Workers currently alive.
    pub active_threads: AtomicUsize,
}

impl PoolMetrics {
    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            active_threads: self.active_threads.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`PoolMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    /// Jobs accepted by `submit`.
    pub jobs_submitted: u64,
    /// Jobs run to completion.
    pub jobs_completed: u64,
    /// Jobs rejected by a full queue.
    pub jobs_rejected: u64,
    /// Jobs that panicked.
    pub jobs_panicked: u64,
    /// Workers currently alive.
    pub active_threads: usize,
}

enum Job {
    Run(Work),
    Stop,
}

/// Bounded-queue worker pool for background jobs.
pub struct BackgroundPool {
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
    shutdown: AtomicBool,
    threads: usize,
}

impl BackgroundPool {
    /// Spawns the configured number of worker threads.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let (sender, receiver) = channel::bounded::<Job>(config.max_queue_size);
        let metrics = Arc::new(PoolMetrics::default());

        #[cfg(feature = "tracing")]
        info!(
            threads = config.threads,
            max_queue_size = config.max_queue_size,
            "starting background pool"
        );

        let mut workers = Vec::with_capacity(config.threads);
        for i in 0..config.threads {
            workers.push(spawn_worker(
                format!("{}-{i}", config.thread_name_prefix),
                receiver.clone(),
                metrics.clone(),
            ));
        }

        Self {
            sender,
            workers: Mutex::new(workers),
            metrics,
            shutdown: AtomicBool::new(false),
            threads: config.threads,
        }
    }

    /// Hands `work` to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::QueueFull`] when the queue is at capacity and
    /// [`SubmitError::ShuttingDown`] once shutdown has begun.
    pub fn submit(&self, work: Work) -> Result<(), SubmitError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }

        match self.sender.try_send(Job::Run(work)) {
            Ok(()) => {
                self.metrics.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                error!("background job rejected, queue full");
                Err(SubmitError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShuttingDown),
        }
    }

    /// Returns the pool's counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops accepting work, lets queued jobs finish, and joins the workers.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "tracing")]
        info!("shutting down background pool");

        for _ in 0..self.threads {
            // Blocking send: the stop marker must land even when the queue
            // is momentarily full.
            let _ = self.sender.send(Job::Stop);
        }

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    name: String,
    receiver: Receiver<Job>,
    metrics: Arc<PoolMetrics>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            metrics.active_threads.fetch_add(1, Ordering::AcqRel);

            #[cfg(feature = "tracing")]
            debug!("worker started");

            loop {
                match receiver.recv() {
                    Ok(Job::Run(work)) => {
                        if catch_unwind(AssertUnwindSafe(work)).is_err() {
                            metrics.jobs_panicked.fetch_add(1, Ordering::Relaxed);
                            #[cfg(feature = "tracing")]
                            error!("background job panicked");
                        } else {
                            metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(Job::Stop) | Err(_) => break,
                }
            }

            metrics.active_threads.fetch_sub(1, Ordering::AcqRel);

            #[cfg(feature = "tracing")]
            debug!("worker exiting");
        })
        .expect("failed to spawn background worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

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
    fn runs_submitted_jobs() {
        let pool = BackgroundPool::new(PoolConfig {
            threads: 2,
            ..PoolConfig::default()
        });
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let count = count.clone();
            pool.submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 10
        }));
        assert_eq!(pool.metrics().jobs_submitted, 10);
    }

    #[test]
    fn full_queue_rejects_jobs() {
        let pool = BackgroundPool::new(PoolConfig {
            threads: 1,
            max_queue_size: 1,
            ..PoolConfig::default()
        });

        // Park the only worker so nothing leaves the queue.
        let (started_tx, started_rx) = channel::bounded::<()>(0);
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        pool.submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        }))
        .unwrap();
        started_rx.recv().unwrap();

        assert!(pool.submit(Box::new(|| {})).is_ok());
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(SubmitError::QueueFull)
        ));
        assert_eq!(pool.metrics().jobs_rejected, 1);

        gate_tx.send(()).unwrap();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = BackgroundPool::new(PoolConfig {
            threads: 1,
            ..PoolConfig::default()
        });
        pool.shutdown();

        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(SubmitError::ShuttingDown)
        ));
        assert_eq!(pool.metrics().active_threads, 0);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = BackgroundPool::new(PoolConfig {
            threads: 1,
            ..PoolConfig::default()
        });
        let count = Arc::new(AtomicU32::new(0));

        pool.submit(Box::new(|| panic!("bad job"))).unwrap();
        let survivor = count.clone();
        pool.submit(Box::new(move || {
            survivor.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(pool.metrics().jobs_panicked, 1);
    }
}
