//! Serial task queue for persistence work.
//!
//! A single dedicated worker thread drains a channel of boxed jobs in
//! strict submission order, so epoch commits are totally ordered without
//! ever blocking the acquisition thread. Each task carries a cancellation
//! token that is honored before the job starts; once a job begins it runs
//! to completion, because nothing below it can roll back.

use crate::error::{DaqError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Cooperative cancellation flag shared between a submitter and the worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct QueuedTask {
    job: Job,
    cancel: CancellationToken,
    done_tx: mpsc::Sender<Result<()>>,
}

/// Handle to a submitted task.
pub struct TaskHandle {
    done_rx: mpsc::Receiver<Result<()>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Requests cancellation; only effective before the job starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the task finished (or was skipped) and returns its
    /// result. A task whose worker disappeared reports `Cancelled`.
    pub fn wait(self) -> Result<()> {
        match self.done_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(DaqError::Cancelled),
        }
    }
}

/// Single-consumer work queue with strict submission-order execution.
pub struct SerialTaskQueue {
    tx: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTaskQueue {
    /// Spawns the worker thread. `name` labels the thread for diagnostics.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedTask>();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || {
                for task in rx {
                    if task.cancel.is_cancelled() {
                        let _ = task.done_tx.send(Err(DaqError::Cancelled));
                        continue;
                    }
                    let result = (task.job)();
                    if let Err(e) = &result {
                        debug!(error = %e, "queued task failed");
                    }
                    let _ = task.done_tx.send(result);
                }
                debug!("serial task worker exiting");
            })
            .expect("failed to spawn serial task worker");

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a job; jobs run one at a time in submission order.
    pub fn submit<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let cancel = CancellationToken::default();
        let task = QueuedTask {
            job: Box::new(job),
            cancel: cancel.clone(),
            done_tx,
        };
        if let Some(tx) = self.tx.lock().as_ref() {
            // A send failure means the worker is gone; the dropped done_tx
            // makes wait() report Cancelled.
            let _ = tx.send(task);
        }
        TaskHandle { done_rx, cancel }
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("open", &self.tx.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_submission_order() {
        let queue = SerialTaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                queue.submit(move || {
                    // Uneven work must not reorder completions.
                    if i % 2 == 0 {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    log.lock().push(i);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_error_reaches_the_waiter() {
        let queue = SerialTaskQueue::new("test");
        let handle = queue.submit(|| Err(DaqError::State("boom".into())));
        assert!(matches!(handle.wait(), Err(DaqError::State(_))));
    }

    #[test]
    fn test_cancellation_before_start_skips_the_job() {
        let queue = SerialTaskQueue::new("test");
        let ran = Arc::new(AtomicBool::new(false));

        // Park the worker so the second task is still queued when we
        // cancel it.
        let gate = queue.submit(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        let flag = ran.clone();
        let victim = queue.submit(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        victim.cancel();

        gate.wait().unwrap();
        assert!(matches!(victim.wait(), Err(DaqError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_joins_the_worker() {
        let queue = SerialTaskQueue::new("test");
        let handle = queue.submit(|| Ok(()));
        drop(queue);
        // The queued task completed before the worker shut down.
        handle.wait().unwrap();
    }
}
