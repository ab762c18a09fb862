//! Single-consumer queue of deferred work for one sync root.
//!
//! Every mutating operation triggered by the local watcher, the remote
//! watcher or a shell command is enqueued here and awaited one at a time in
//! submission order. Platform callbacks do not go through the queue; they
//! are serialized against it by the path locks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Mutex;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedTask {
    label: String,
    task: Task,
}

pub struct TaskQueue {
    name: String,
    tx: mpsc::UnboundedSender<QueuedTask>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawn the consumer. It stops when `cancel` (or [`stop`](Self::stop))
    /// fires, after finishing whatever was already queued.
    pub fn start(name: impl Into<String>, cancel: CancellationToken) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(Self::consume(name.clone(), rx, cancel.clone()));
        Self {
            name,
            tx,
            cancel,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    async fn consume(
        name: String,
        mut rx: mpsc::UnboundedReceiver<QueuedTask>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(item) => Self::run_one(&name, item).await,
                    None => return,
                },
            }
        }

        // Refuse new work, then drain what was accepted
        rx.close();
        let mut drained = 0usize;
        while let Some(item) = rx.recv().await {
            Self::run_one(&name, item).await;
            drained += 1;
        }
        info!(queue = %name, drained, "task queue stopped");
    }

    async fn run_one(queue: &str, item: QueuedTask) {
        debug!(queue = %queue, task = %item.label, "running task");
        if AssertUnwindSafe(item.task).catch_unwind().await.is_err() {
            error!(queue = %queue, task = %item.label, "task panicked");
        }
    }

    /// Queue `task`. Returns false once the queue has stopped.
    pub fn enqueue<F>(&self, label: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let accepted = self
            .tx
            .send(QueuedTask {
                label: label.clone(),
                task: Box::pin(task),
            })
            .is_ok();
        if !accepted {
            warn!(queue = %self.name, task = %label, "task queue stopped, dropping task");
        }
        accepted
    }

    /// Queue `task` and wait for its result. `None` if the queue stopped
    /// before running it.
    pub async fn run<F, T>(&self, label: impl Into<String>, task: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.enqueue(label, async move {
            let _ = tx.send(task.await);
        });
        if !queued {
            return None;
        }
        rx.await.ok()
    }

    /// Wait until everything queued before this call has run.
    pub async fn flush(&self) {
        self.run("flush", async {}).await;
    }

    /// Cancel the consumer and wait for it to finish the queued work.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = consumer {
            if let Err(e) = handle.await {
                error!(queue = %self.name, "task queue consumer failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let queue = TaskQueue::start("test", CancellationToken::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20u64 {
            let seen = seen.clone();
            queue.enqueue(format!("t{i}"), async move {
                // Later tasks finish faster; order must still hold
                tokio::time::sleep(Duration::from_millis(20 - i)).await;
                seen.lock().unwrap().push(i);
            });
        }
        queue.flush().await;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        queue.stop().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_loop() {
        let queue = TaskQueue::start("test", CancellationToken::new());
        queue.enqueue("boom", async { panic!("boom") });
        assert_eq!(queue.run("after", async { 7 }).await, Some(7));
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_then_refuses() {
        let queue = TaskQueue::start("test", CancellationToken::new());
        let seen = Arc::new(Mutex::new(0));
        for _ in 0..5 {
            let seen = seen.clone();
            queue.enqueue("count", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                *seen.lock().unwrap() += 1;
            });
        }
        queue.stop().await;
        assert_eq!(*seen.lock().unwrap(), 5);
        assert!(!queue.enqueue("late", async {}));
        assert_eq!(queue.run("late", async { 1 }).await, None);
    }
}
