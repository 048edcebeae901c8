//! Named worker threads with a bounded join.
//!
//! `JoinHandle::join` waits forever, so each worker also owns the sending
//! half of a channel that disconnects when the thread exits (normally or by
//! panic). Waiting on that channel gives the join its timeout.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crate::error::{DetectorError, Result};

#[derive(Debug)]
pub struct WorkerThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
}

impl WorkerThread {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Dropped on return or unwind, which disconnects `done_rx`.
                let _done = done_tx;
                body();
            })
            .map_err(DetectorError::ThreadSpawn)?;
        debug!("Spawned worker thread '{name}'");
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            done_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread itself, for waking it from elsewhere.
    pub fn thread(&self) -> Option<Thread> {
        self.handle.as_ref().map(|handle| handle.thread().clone())
    }

    /// Wakes the thread if it is parked waiting for a stop request.
    pub fn unpark(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Joins the thread if it exits within `timeout`.
    ///
    /// Returns `false` and detaches the thread when it does not; the caller
    /// carries on with its own teardown either way.
    pub fn join_within(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Worker thread '{}' panicked", self.name);
                }
                debug!("Joined worker thread '{}'", self.name);
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "Worker thread '{}' did not stop within {:?}; detaching it",
                    self.name, timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn joins_a_finished_thread() {
        let worker = WorkerThread::spawn("quick", || {}).unwrap();
        assert_eq!(worker.name(), "quick");
        assert!(worker.join_within(Duration::from_secs(2)));
    }

    #[test]
    fn a_panicking_thread_still_counts_as_stopped() {
        let worker = WorkerThread::spawn("panics", || panic!("boom")).unwrap();
        assert!(worker.join_within(Duration::from_secs(2)));
    }

    #[test]
    fn gives_up_on_a_stuck_thread() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let worker = WorkerThread::spawn("stuck", move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
        assert!(!worker.join_within(Duration::from_millis(30)));
        release.store(true, Ordering::Release);
    }
}
