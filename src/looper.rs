#![forbid(unsafe_code)]

//! Home-thread loop primitive.
//!
//! The dispatcher core needs exactly two capabilities from the loop that
//! hosts it: enqueue a callback to run on the home thread, and answer
//! whether the current thread is that thread. [`Looper`] captures that
//! minimal contract; [`ThreadLooper`] is the in-crate implementation backed
//! by a dedicated named thread and a crossbeam channel. Embedders with their
//! own event loop (a UI toolkit, a game loop) implement [`Looper`] over it
//! instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::{debug, error};

/// Errors raised when the home loop cannot accept a wake callback.
#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    /// The loop has been shut down and no longer processes callbacks.
    #[error("home loop is shut down")]
    LoopClosed,
}

/// Minimal home-thread loop contract consumed by the dispatcher core.
pub trait Looper: Send + Sync {
    /// Enqueues `work` to run on the home thread.
    ///
    /// Must be callable from any thread. The loop may run the callback at
    /// any later point; it must never drop an accepted callback silently.
    ///
    /// # Errors
    ///
    /// Returns [`WakeError::LoopClosed`] once the loop has shut down.
    fn execute(&self, work: Box<dyn FnOnce() + Send>) -> Result<(), WakeError>;

    /// Returns `true` when called from the home thread itself.
    fn is_home_thread(&self) -> bool;
}

enum LoopJob {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

/// [`Looper`] backed by a dedicated thread owned by this instance.
///
/// Callbacks execute in submission order. Shutdown is graceful: already
/// accepted callbacks run before the thread exits.
pub struct ThreadLooper {
    sender: Sender<LoopJob>,
    home: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadLooper {
    /// Spawns the home thread under the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = channel::unbounded::<LoopJob>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                #[cfg(feature = "tracing")]
                debug!("home loop started");

                while let Ok(job) = receiver.recv() {
                    match job {
                        LoopJob::Run(work) => {
                            // A panicking callback must not take the loop,
                            // and with it every lane, down.
                            if catch_unwind(AssertUnwindSafe(work)).is_err() {
                                #[cfg(feature = "tracing")]
                                error!("home loop callback panicked");
                            }
                        }
                        LoopJob::Stop => break,
                    }
                }

                #[cfg(feature = "tracing")]
                debug!("home loop exiting");
            })
            .expect("failed to spawn home loop thread");

        let home = handle.thread().id();
        Self {
            sender,
            home,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the loop and joins the home thread.
    ///
    /// Callbacks already accepted still run before the thread exits. Must
    /// not be called from the home thread itself, as it would join on the
    /// calling thread.
    pub fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(LoopJob::Stop);
            let _ = handle.join();
        }
    }
}

impl Looper for ThreadLooper {
    fn execute(&self, work: Box<dyn FnOnce() + Send>) -> Result<(), WakeError> {
        self.sender
            .send(LoopJob::Run(work))
            .map_err(|_| WakeError::LoopClosed)
    }

    #[inline]
    fn is_home_thread(&self) -> bool {
        thread::current().id() == self.home
    }
}

impl Drop for ThreadLooper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
