//! Homepost: Time-Sliced Dual-Lane Task Dispatch onto a Home Thread
//!
//! This library serializes work from many producer threads onto one "home"
//! thread, the way UI frameworks funnel everything through their main loop,
//! without being tied to any particular framework.
//!
//! # Features
//!
//! - **Dual lanes**: independent sync (high-priority) and async FIFO queues,
//!   each draining in its own wake of the home loop
//! - **Time-sliced drains**: a drain pass yields back to the host loop after
//!   a bounded wall-clock budget (16ms by default) and reschedules itself
//! - **Safe cancellation**: every posted task returns a handle; cancellation
//!   races with execution are resolved exactly-once
//! - **Blocking bridge**: call a closure on the home thread and block for
//!   its value, with optional timeout and an explicit cancel-on-timeout
//!   policy
//! - **Timed and periodic posting**: delayed posts, absolute-time posts, and
//!   finite or open-ended intervals delivered to any target
//!
//! # Example
//!
//! ```rust
//! use homepost::{Run, RunConfig, Target};
//!
//! let run = Run::new(RunConfig::default());
//!
//! // Fire-and-forget on the home thread.
//! let task = run.post(Target::HomeAsync, || println!("on the home thread"))?;
//!
//! // Block for a value computed on the home thread.
//! let answer = run.call(|| 6 * 7)?;
//! assert_eq!(answer, 42);
//!
//! task.cancel(); // no-op if it already ran
//! run.dispose();
//! # Ok::<(), homepost::PostError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod background;
pub mod blocking;
pub mod dispatcher;
pub mod looper;
pub mod poster;
pub mod run;
pub mod task;
pub mod timer;

// Re-export commonly used types
pub use background::{BackgroundPool, PoolConfig, PoolMetricsSnapshot, SubmitError};
pub use blocking::{BlockingCall, TimeoutPolicy};
pub use dispatcher::{Dispatcher, DispatcherMetricsSnapshot, OfferError, DEFAULT_TIME_SLICE};
pub use looper::{Looper, ThreadLooper, WakeError};
pub use poster::{HomePoster, Lane, PosterConfig};
pub use run::{IntervalObserver, PostError, Run, RunConfig, Target};
pub use task::Task;
pub use timer::{Timer, TimerHandle};
