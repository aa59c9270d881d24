#![forbid(unsafe_code)]

//! Unit-of-work contract shared by every lane and pool in the crate.
//!
//! A [`Task`] runs exactly once, reports completion, and can be cancelled
//! while it is still waiting in a pending queue. Cancellation and execution
//! racing each other is resolved by the task's own lock: whichever side
//! claims the task first wins, the loser observes a completed task and
//! returns without side effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Type-erased work closure carried by tasks, pool jobs, and timer entries.
pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/// Pending queue a task can remove itself from on cancellation.
///
/// The back-reference is registration only, never ownership: removal of a
/// task that has already been popped must report `false`, not fail.
pub(crate) trait PendingQueue: Send + Sync {
    /// Removes `task` from the queue. Returns `false` if it was not present.
    fn remove(&self, task: &Task) -> bool;
}

/// A cancellable unit of work that executes at most once.
///
/// Created when enqueuing, executed by whichever thread drains the owning
/// lane, and eligible for collection once completed or cancelled. The handle
/// returned by the posting APIs is an `Arc<Task>`, so callers can observe
/// [`Task::is_done`] and call [`Task::cancel`] from any thread.
pub struct Task {
    /// Monotonic completion flag, fast path for `run`/`cancel` re-entry.
    done: AtomicBool,
    state: Mutex<TaskState>,
}

struct TaskState {
    work: Option<Work>,
    /// Lane currently holding this task, used only for O(1) cancel-removal.
    queue: Option<Weak<dyn PendingQueue>>,
}

impl Task {
    /// Wraps `work` in a new task handle.
    #[must_use]
    pub fn new(work: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                work: Some(Box::new(work)),
                queue: None,
            }),
        })
    }

    /// Returns `true` once the task has executed or been cancelled.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Records the pending queue currently holding this task.
    pub(crate) fn attach(&self, queue: Weak<dyn PendingQueue>) {
        self.state.lock().queue = Some(queue);
    }

    /// Executes the wrapped work if the task is neither done nor cancelled.
    ///
    /// Idempotent: a second invocation, concurrent or sequential, returns
    /// without side effects. The work body runs under the task's own lock so
    /// a racing `cancel` waits for it rather than interleaving with it.
    pub fn run(&self) {
        if self.is_done() {
            return;
        }
        let mut state = self.state.lock();
        if self.is_done() {
            return;
        }
        state.queue = None;
        if let Some(work) = state.work.take() {
            work();
        }
        self.done.store(true, Ordering::Release);
    }

    /// Cancels the task if it has not yet run.
    ///
    /// A task still sitting in its pending queue is removed so it never
    /// executes; a task already popped or completed is left alone. Calling
    /// this after completion is a safe no-op.
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        let queue = {
            let mut state = self.state.lock();
            if self.is_done() {
                return;
            }
            self.done.store(true, Ordering::Release);
            state.work = None;
            state.queue.take()
        };
        // Removal failure means the drain loop popped the task first; the
        // done flag above already prevents it from executing.
        if let Some(queue) = queue.and_then(|weak| weak.upgrade()) {
            let _ = queue.remove(self);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("done", &self.is_done()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn run_executes_work_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        task.run();
        task.run();

        assert!(task.is_done());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_run_executes_exactly_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let task = task.clone();
            handles.push(std::thread::spawn(move || task.run()));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_before_run_suppresses_work() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        task.cancel();
        task.run();

        assert!(task.is_done());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_run_is_a_no_op() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        task.run();
        task.cancel();
        task.cancel();

        assert!(task.is_done());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_removes_task_from_its_queue() {
        struct RecordingQueue {
            removed: AtomicU32,
        }
        impl PendingQueue for RecordingQueue {
            fn remove(&self, _task: &Task) -> bool {
                self.removed.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let queue = Arc::new(RecordingQueue {
            removed: AtomicU32::new(0),
        });
        let task = Task::new(|| {});
        let dyn_queue: Arc<dyn PendingQueue> = queue.clone();
        task.attach(Arc::downgrade(&dyn_queue));

        task.cancel();
        assert_eq!(queue.removed.load(Ordering::SeqCst), 1);

        // A second cancel must not attempt a second removal.
        task.cancel();
        assert_eq!(queue.removed.load(Ordering::SeqCst), 1);
    }
}
