//! Single-concurrency FIFO task queue
//!
//! Every batch of every job goes through one [`TaskQueue`]. Tasks run one at a
//! time in submission order; a failing (or panicking) task only fails its own
//! [`TaskHandle`] and the drain loop moves on to the next task.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{IngestError, Result};

type BoxedTask = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

enum TaskOutcome {
    Completed,
    Failed(String),
}

struct QueuedTask {
    id: u64,
    label: String,
    run: BoxedTask,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    processing: bool,
}

#[derive(Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Serializes asynchronous units of work
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task` and start a drain loop if none is active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, T>(&self, label: impl Into<String>, task: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let run: BoxedTask = Box::pin(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(IngestError::TaskAborted),
            };
            let outcome = match &result {
                Ok(_) => TaskOutcome::Completed,
                Err(e) => TaskOutcome::Failed(e.to_string()),
            };
            // The submitter may have dropped its handle; the task still counts.
            let _ = tx.send(result);
            outcome
        });

        let start_drain = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(QueuedTask { id, label: label.into(), run });
            !std::mem::replace(&mut state.processing, true)
        };

        if start_drain {
            tokio::spawn(Self::drain(Arc::clone(&self.inner)));
        }

        TaskHandle { id, rx }
    }

    async fn drain(inner: Arc<QueueInner>) {
        loop {
            let task = {
                let mut state = inner.state.lock();
                match state.pending.pop_front() {
                    Some(task) => task,
                    None => {
                        state.processing = false;
                        return;
                    }
                }
            };

            match task.run.await {
                TaskOutcome::Completed => {
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                    info!(task_id = task.id, task = %task.label, "task completed");
                }
                TaskOutcome::Failed(error) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(task_id = task.id, task = %task.label, %error, "task failed");
                }
            }
        }
    }

    /// Number of tasks waiting to start
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether a drain loop is currently active
    pub fn is_processing(&self) -> bool {
        self.inner.state.lock().processing
    }

    /// Queue statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len(),
            processing: state.processing,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

/// Resolves with the result of one submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Queue-assigned task id, increasing in submission order
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(IngestError::TaskAborted)))
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: bool,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn wait_until_idle(queue: &TaskQueue) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.is_processing() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue did not go idle");
    }

    #[tokio::test]
    async fn test_tasks_finish_in_submission_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, delay_ms) in [("A", 30u64), ("B", 1), ("C", 10)] {
            let log = Arc::clone(&log);
            handles.push(queue.submit(name, async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().push(name);
                Ok(())
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_stop_the_queue() {
        let queue = TaskQueue::new();
        let ran_c = Arc::new(AtomicUsize::new(0));

        let a = queue.submit("A", async { Ok(1) });
        let b = queue.submit("B", async { Err::<i32, _>(IngestError::storage("disk full")) });
        let c = {
            let ran_c = Arc::clone(&ran_c);
            queue.submit("C", async move {
                ran_c.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
        };

        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Err(IngestError::storage("disk full")));
        assert_eq!(c.await, Ok(3));
        assert_eq!(ran_c.load(Ordering::SeqCst), 1);

        wait_until_idle(&queue).await;
        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_as_aborted() {
        let queue = TaskQueue::new();

        let boom = queue.submit("boom", async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        });
        let after = queue.submit("after", async { Ok("still running") });

        assert_eq!(boom.await, Err(IngestError::TaskAborted));
        assert_eq!(after.await, Ok("still running"));
    }

    #[tokio::test]
    async fn test_at_most_one_task_runs_at_a_time() {
        let queue = TaskQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                queue.submit(format!("task-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_loop_restarts_after_going_idle() {
        let queue = TaskQueue::new();

        queue.submit("first", async { Ok(()) }).await.unwrap();
        wait_until_idle(&queue).await;
        assert_eq!(queue.pending_len(), 0);

        let handle = queue.submit("second", async { Ok(()) });
        assert!(handle.id() > 0);
        handle.await.unwrap();
        wait_until_idle(&queue).await;
        assert_eq!(queue.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_runs_task() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = Arc::clone(&ran);
            drop(queue.submit("fire-and-forget", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        queue.submit("barrier", async { Ok(()) }).await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
