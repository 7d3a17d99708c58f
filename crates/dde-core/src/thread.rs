//! Single-thread executor backing one execution context.
//!
//! The underlying facility is strictly thread-affine: instances, string
//! handles and conversations may only be touched from the OS thread that
//! initialized the instance. Every facility call of the managed objects is
//! therefore funneled through this executor, and cross-thread teardown
//! (typically from a `Drop` running on an arbitrary thread) is posted to the
//! owning thread instead of being executed in place.

use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::DdeError;

type Job = Box<dyn FnOnce() + Send>;

/// Dedicated worker thread processing facility work in submission order.
///
/// Dropping the executor closes the queue; the worker drains outstanding
/// jobs (including posted teardown work) and exits.
pub(crate) struct DdeThread {
    sender: mpsc::Sender<Job>,
    thread_id: ThreadId,
    worker: Option<JoinHandle<()>>,
}

impl DdeThread {
    pub(crate) fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker = thread::Builder::new()
            .name("dde-context".to_owned())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("spawning the context thread never fails on supported platforms");

        let thread_id = worker.thread().id();

        Self {
            sender,
            thread_id,
            worker: Some(worker),
        }
    }

    pub(crate) fn is_owning_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Runs `job` on the owning thread and blocks until it finishes.
    ///
    /// Executes inline when already called from the owning thread, so a
    /// callback handler may re-enter the managed API without deadlocking.
    pub(crate) fn invoke<R, F>(&self, job: F) -> Result<R, DdeError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_owning_thread() {
            return Ok(job());
        }

        let (reply_tx, reply_rx) = mpsc::channel();

        self.sender
            .send(Box::new(move || {
                // The caller may have given up waiting; that is fine.
                let _ = reply_tx.send(job());
            }))
            .map_err(|_| DdeError::ThreadGone)?;

        reply_rx.recv().map_err(|_| DdeError::ThreadGone)
    }

    /// Queues `job` on the owning thread without waiting for it.
    ///
    /// Used for teardown triggered from a foreign thread. Returns `false`
    /// when the owning thread already exited.
    pub(crate) fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(job)).is_ok()
    }
}

impl Drop for DdeThread {
    fn drop(&mut self) {
        // Close the queue first so the worker can exit, then reap it unless
        // we are the worker itself (teardown posted onto the owning thread).
        let (closed_tx, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.sender, closed_tx));

        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.thread_id {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn invoke_runs_on_owning_thread() {
        let executor = DdeThread::spawn();

        assert!(!executor.is_owning_thread());

        let worker_thread = executor
            .invoke(|| thread::current().id())
            .expect("worker is running");
        assert_ne!(worker_thread, thread::current().id());
    }

    #[test]
    fn invoke_returns_job_result() {
        let executor = DdeThread::spawn();
        let value = executor.invoke(|| 1 + 2).expect("worker is running");
        assert_eq!(value, 3);
    }

    #[test]
    fn posted_jobs_run_before_shutdown() {
        let executor = DdeThread::spawn();
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        assert!(executor.post(move || ran_clone.store(true, Ordering::SeqCst)));

        drop(executor);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_invoke_does_not_deadlock() {
        let executor = Arc::new(DdeThread::spawn());

        let executor_clone = Arc::clone(&executor);
        let nested = executor
            .invoke(move || executor_clone.invoke(|| 7).expect("inline re-entry"))
            .expect("worker is running");

        assert_eq!(nested, 7);
    }
}
