//! Dedicated worker thread for one job.
//!
//! Native training runtimes are bound to the thread that created them, so a
//! job never migrates: it runs as a single task on a current-thread runtime
//! owned by its own OS thread.

use crate::error::{JobError, JobResult};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error};

pub struct JobWorker<T> {
    name: String,
    result: oneshot::Receiver<T>,
    thread: JoinHandle<()>,
}

impl<T: Send + 'static> JobWorker<T> {
    /// Starts `job` on a new thread. The future is built on that thread, so it
    /// does not need to be `Send`.
    pub fn spawn<F, Fut>(name: impl Into<String>, job: F) -> JobResult<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let name = name.into();
        let (tx, result) = oneshot::channel();
        let thread_name = name.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = %thread_name, error = %e, "Failed to build job runtime");
                        return;
                    }
                };
                let output = runtime.block_on(job());
                if tx.send(output).is_err() {
                    debug!(worker = %thread_name, "Job result dropped, nobody is waiting");
                }
            })
            .map_err(|e| JobError::Worker(format!("cannot spawn {name}: {e}")))?;

        Ok(Self { name, result, thread })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the job's output. A worker that panicked or never produced a
    /// result surfaces as [`JobError::Worker`].
    pub async fn join(self) -> JobResult<T> {
        self.result
            .await
            .map_err(|_| JobError::Worker(format!("{} exited without a result", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_runs_on_named_thread() {
        let caller = std::thread::current().id();
        let worker = JobWorker::spawn("kiln-job-test", move || async move {
            let current = std::thread::current();
            (current.id() != caller, current.name().map(str::to_string))
        })
        .unwrap();

        let (other_thread, name) = worker.join().await.unwrap();

        assert!(other_thread);
        assert_eq!(name.as_deref(), Some("kiln-job-test"));
    }

    #[tokio::test]
    async fn test_non_send_future_is_accepted() {
        let worker = JobWorker::spawn("kiln-job-rc", || async {
            let shared = std::rc::Rc::new(41);
            tokio::task::yield_now().await;
            *shared + 1
        })
        .unwrap();
        assert_eq!(worker.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_panicking_job_is_worker_error() {
        let crash = true;
        let worker = JobWorker::spawn("kiln-job-panic", move || async move {
            assert!(!crash, "runtime crashed");
            7u32
        })
        .unwrap();
        assert!(matches!(worker.join().await, Err(JobError::Worker(_))));
    }
}
