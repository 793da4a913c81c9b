//! Fixed-size worker pool
//!
//! Connection receive loops run on this pool rather than as free-floating
//! tasks, which caps how much socket work proceeds concurrently and gives
//! shutdown a single join point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::queue::Fifo;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool of `n` workers draining a shared task queue.
///
/// Each unit of work runs inside its own spawned task so a panic is
/// caught and logged instead of taking the worker down.
pub struct WorkerPool {
    queue: Arc<Fifo<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let queue: Arc<Fifo<Task>> = Arc::new(Fifo::unbounded());

        let workers = (0..size)
            .map(|index| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    Self::worker_loop(index, queue).await;
                })
            })
            .collect();

        Self {
            queue,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a unit of work. Dropped (with a log line) after shutdown.
    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.queue.try_push(Box::pin(work)).is_err() {
            warn!("worker pool is shut down; task dropped");
        }
    }

    /// Number of queued, not-yet-started tasks.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue and join the workers.
    ///
    /// In-flight tasks run to completion; queued but unstarted tasks are
    /// discarded. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.await;
        }
    }

    async fn worker_loop(index: usize, queue: Arc<Fifo<Task>>) {
        while let Some(task) = queue.pop().await {
            if queue.is_shutdown() {
                // Unstarted work queued before shutdown is discarded
                continue;
            }
            if let Err(e) = tokio::spawn(task).await {
                warn!(worker = index, error = %e, "worker task failed");
            }
        }
        debug!(worker = index, "worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_tasks_run() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tasks did not complete");

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(async {
            panic!("deliberate failure");
        });

        let after = Arc::clone(&counter);
        pool.submit(async move {
            after.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker died after panic");

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_unstarted_tasks() {
        let pool = WorkerPool::new(1);
        let started = Arc::new(AtomicUsize::new(0));

        // Occupy the single worker
        let occupier = Arc::clone(&started);
        pool.submit(async move {
            occupier.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        // Queue work that should never start
        let unstarted = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let unstarted = Arc::clone(&unstarted);
            pool.submit(async move {
                unstarted.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Let the occupier begin, then shut down while it sleeps
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        pool.shutdown().await;

        assert_eq!(unstarted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(2);
        pool.shutdown().await;
        pool.shutdown().await;
        pool.submit(async {}); // dropped, not a panic
    }
}
