use crate::errors::{SyncError, SyncResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    label: String,
    task: TaskFuture,
    queued_at: Instant,
}

/// Result handle of a task submitted to the [`MutationQueue`].
pub struct PendingCommit<T> {
    label: String,
    receiver: oneshot::Receiver<SyncResult<T>>,
}

impl<T> fmt::Debug for PendingCommit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommit")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<T> PendingCommit<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn wait(self) -> SyncResult<T> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::QueueClosed(format!(
                "{} was dropped before it completed",
                self.label
            ))),
        }
    }
}

/// Single worker draining a FIFO channel: at most one task runs at a time,
/// in submission order, for every entity kind sharing the queue.
#[derive(Clone)]
pub struct MutationQueue {
    sender: mpsc::UnboundedSender<QueuedTask>,
    pending: Arc<AtomicUsize>,
}

impl MutationQueue {
    /// Spawns the worker; must be called inside a tokio runtime.
    pub fn start(slow_task_warn: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_loop(receiver, pending.clone(), slow_task_warn));
        Self { sender, pending }
    }

    /// Enqueues synchronously; the task starts once every earlier task has
    /// settled. A failing task only fails its own handle.
    pub fn submit<F, T>(&self, label: &str, task: F) -> PendingCommit<T>
    where
        F: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let task_label = label.to_string();
        let wrapped = async move {
            let result = task.await;
            if let Err(error) = &result {
                tracing::debug!(task = %task_label, error = %error, "queued task failed");
            }
            let _ = sender.send(result);
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedTask {
            label: label.to_string(),
            task: Box::pin(wrapped),
            queued_at: Instant::now(),
        };
        if self.sender.send(queued).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(task = %label, "mutation queue worker is gone");
        }

        PendingCommit {
            label: label.to_string(),
            receiver,
        }
    }

    /// Number of tasks submitted but not yet settled.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once every task submitted before this call has settled.
    pub async fn idle(&self) -> SyncResult<()> {
        self.submit("queue.barrier", async { Ok(()) }).wait().await
    }
}

async fn run_loop(
    mut receiver: mpsc::UnboundedReceiver<QueuedTask>,
    pending: Arc<AtomicUsize>,
    slow_task_warn: Duration,
) {
    while let Some(queued) = receiver.recv().await {
        let started = Instant::now();
        let waited = started.duration_since(queued.queued_at);
        // Spawned so a panicking task drops its result sender instead of the worker.
        if let Err(error) = tokio::spawn(queued.task).await {
            tracing::error!(task = %queued.label, error = %error, "queued task aborted");
        }
        pending.fetch_sub(1, Ordering::SeqCst);

        let elapsed = started.elapsed();
        if elapsed >= slow_task_warn {
            tracing::warn!(
                task = %queued.label,
                elapsed_ms = elapsed.as_millis() as u64,
                waited_ms = waited.as_millis() as u64,
                "queued task held the mutation queue"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MutationQueue;
    use crate::errors::SyncError;
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tasks_run_one_at_a_time_in_fifo_order() {
        let queue = MutationQueue::start(Duration::from_secs(5));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (index, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let log = log.clone();
            handles.push(queue.submit("step", async move {
                log.lock().expect("log").push(format!("start {}", index));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().expect("log").push(format!("end {}", index));
                Ok(index)
            }));
        }
        for (expected, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await.expect("task"), expected);
        }

        assert_eq!(
            *log.lock().expect("log"),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn failures_do_not_block_later_tasks() {
        let queue = MutationQueue::start(Duration::from_secs(5));
        let failing = queue.submit::<_, ()>("fails", async {
            Err(SyncError::Backend("boom".to_string()))
        });
        let succeeding = queue.submit("succeeds", async { Ok("done") });

        assert_eq!(failing.wait().await.expect_err("fails").code(), "BACKEND_FAILURE");
        assert_eq!(succeeding.wait().await.expect("succeeds"), "done");
    }

    async fn explode() -> crate::errors::SyncResult<()> {
        panic!("task exploded")
    }

    #[tokio::test]
    async fn panicking_task_reports_queue_closed_and_worker_survives() {
        let queue = MutationQueue::start(Duration::from_secs(5));
        let panicking = queue.submit("panics", explode());
        let after = queue.submit("after", async { Ok(1) });

        assert_eq!(panicking.wait().await.expect_err("panicked").code(), "QUEUE_CLOSED");
        assert_eq!(after.wait().await.expect("after"), 1);
        queue.idle().await.expect("idle");
    }

    struct Unprintable;

    #[tokio::test]
    async fn pending_commit_debug_shows_its_label() {
        let queue = MutationQueue::start(Duration::from_secs(5));
        let pending = queue.submit("save p1", async { Ok(Unprintable) });
        let printed = format!("{:?}", pending);
        assert!(printed.contains("PendingCommit"));
        assert!(printed.contains("save p1"));
        assert!(pending.wait().await.is_ok());
    }
}
