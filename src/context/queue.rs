//! Queue affinity for contexts.
//!
//! Each context is pinned to exactly one [`Queue`]: a dedicated worker
//! thread draining FIFO jobs. All access to a context's graph goes through
//! its queue, which is what makes saves serialize with mutations without
//! holding locks across user code.

use crate::error::{Error, Result};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A labeled serial execution queue backed by one worker thread.
///
/// The worker exits when every handle to the queue has been dropped.
#[derive(Clone)]
pub(crate) struct Queue {
    label: String,
    tx: Sender<Job>,
    worker: ThreadId,
}

impl Queue {
    /// Spawn the worker and return a handle.
    pub(crate) fn spawn(label: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        });
        Self {
            label: label.to_string(),
            tx,
            worker: handle.thread().id(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue a job; returns immediately.
    ///
    /// Jobs enqueued from the worker itself still go to the back of the
    /// queue, preserving FIFO order.
    pub(crate) fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!(queue = %self.label, "queue terminated, job dropped");
        }
    }

    /// Run a job on the queue and wait for its result.
    ///
    /// Calls from the worker thread itself run the job inline instead of
    /// deadlocking on their own queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManagerGone`] if the worker has terminated.
    pub(crate) fn run_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.worker {
            return Ok(f());
        }

        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(Box::new(move || {
                let _ = done_tx.send(f());
            }))
            .map_err(|_| Error::ManagerGone)?;
        done_rx.recv().map_err(|_| Error::ManagerGone)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_in_order() {
        let queue = Queue::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().unwrap().push(i));
        }
        queue.run_sync(|| ()).unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_sync_returns_value() {
        let queue = Queue::spawn("test");
        let value = queue.run_sync(|| 40 + 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_sync_from_own_worker_runs_inline() {
        let queue = Queue::spawn("test");
        let reentrant = queue.clone();

        // Without the inline shortcut this would deadlock.
        let value = queue
            .run_sync(move || reentrant.run_sync(|| 7).unwrap())
            .unwrap();
        assert_eq!(value, 7);
    }
}
