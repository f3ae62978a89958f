//! Deferred work.
//!
//! Server-auth completion and notifications to other clients run as
//! separate jobs instead of inside the handler that caused them. A job
//! only ever locks the one client it targets, so two clients never hold
//! each other's locks.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere other than the caller's stack.
pub trait Dispatcher: Send + Sync {
    /// Schedule `job`. Must not run it on the calling thread.
    fn dispatch(&self, job: Job);
}

/// Holds jobs until [`QueuedDispatcher::run_pending`] is called.
///
/// Useful to drive the protocol deterministically without a runtime.
#[derive(Default)]
pub struct QueuedDispatcher {
    jobs: Mutex<VecDeque<Job>>,
}

impl QueuedDispatcher {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Remove the oldest queued job without running it.
    pub fn take_next(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    /// Run the oldest queued job. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        // Release the queue before running so the job may dispatch more.
        match self.take_next() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run queued jobs, including those they enqueue, until none are left.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Dispatcher for QueuedDispatcher {
    fn dispatch(&self, job: Job) {
        self.lock().push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_only_when_asked() {
        let queue = QueuedDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        queue.dispatch(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(queue.pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn jobs_may_enqueue_more_jobs() {
        let queue = Arc::new(QueuedDispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let (q, h) = (Arc::clone(&queue), Arc::clone(&hits));
        queue.dispatch(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            let h2 = Arc::clone(&h);
            q.dispatch(Box::new(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_next_takes_one_job_in_order() {
        let queue = QueuedDispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for n in 0..2 {
            let o = Arc::clone(&order);
            queue.dispatch(Box::new(move || o.lock().unwrap().push(n)));
        }

        assert!(queue.run_next());
        assert_eq!(*order.lock().unwrap(), vec![0]);
        assert_eq!(queue.pending(), 1);
        assert!(queue.run_next());
        assert!(!queue.run_next());
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }
}
