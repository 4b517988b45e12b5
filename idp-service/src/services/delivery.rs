//! Bounded background worker pool.
//!
//! Jobs go through a bounded `mpsc` queue drained by a fixed number of
//! workers. Submission never waits: a full queue rejects the job and the
//! caller decides how to account for it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    async fn handle(&self, job: T);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("delivery queue is full")]
    QueueFull,

    #[error("delivery queue is closed")]
    Closed,
}

pub struct WorkerPool<T> {
    sender: mpsc::Sender<T>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn spawn(
        name: &'static str,
        workers: usize,
        capacity: usize,
        handler: Arc<dyn JobHandler<T>>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut guard = receiver.lock().await;
                            guard.recv().await
                        };
                        match job {
                            Some(job) => handler.handle(job).await,
                            None => break,
                        }
                    }
                    tracing::debug!(pool = name, worker_id, "Worker stopped");
                })
            })
            .collect();

        tracing::info!(pool = name, capacity, "Worker pool started");

        Self {
            sender,
            workers,
            capacity: capacity.max(1),
        }
    }

    pub fn try_submit(&self, job: T) -> Result<(), SubmitError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Jobs waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler<u32> for Counting {
        async fn handle(&self, _job: u32) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Blocking {
        release: Notify,
    }

    #[async_trait]
    impl JobHandler<u32> for Blocking {
        async fn handle(&self, _job: u32) {
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_jobs_are_processed() {
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn("test", 2, 16, handler.clone());
        for i in 0..10 {
            pool.try_submit(i).unwrap();
        }

        for _ in 0..100 {
            if handler.seen.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let handler = Arc::new(Blocking {
            release: Notify::new(),
        });
        let pool = WorkerPool::spawn("test", 1, 2, handler.clone());

        // One job occupies the worker, two fill the queue.
        pool.try_submit(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.try_submit(2).unwrap();
        pool.try_submit(3).unwrap();

        assert_eq!(pool.try_submit(4), Err(SubmitError::QueueFull));
        assert_eq!(pool.backlog(), 2);
    }
}
