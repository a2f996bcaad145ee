//! Worker pool with bounded admission.
//!
//! A named pool rejects new work once its aggregate pending depth passes
//! the high-water mark; this is the node's sole admission valve. Task
//! errors are captured and logged, never propagated into the pool.

use quorus_common::ObjectError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};

type PoolTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    tx: mpsc::UnboundedSender<PoolTask>,
    pending: Arc<AtomicUsize>,
    pending_limit: usize,
}

impl WorkerPool {
    /// Create a pool with `workers` concurrent executors and the given
    /// admission high-water mark.
    pub fn new(name: &str, workers: usize, pending_limit: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolTask>();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let pending = Arc::new(AtomicUsize::new(0));

        let dispatcher_pending = pending.clone();
        let pool_name = name.to_string();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break, // pool torn down
                };
                let pending = dispatcher_pending.clone();
                tokio::spawn(async move {
                    task.await;
                    pending.fetch_sub(1, Ordering::AcqRel);
                    drop(permit);
                });
            }
            tracing::debug!("worker pool '{}' dispatcher stopped", pool_name);
        });

        Self {
            name: name.to_string(),
            tx,
            pending,
            pending_limit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate pending depth: queued plus running tasks.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Enqueue a fire-and-forget task. Rejected with `Unavailable` when the
    /// pending depth exceeds the high-water mark.
    pub fn enqueue<F>(&self, task: F) -> Result<(), ObjectError>
    where
        F: Future<Output = Result<(), ObjectError>> + Send + 'static,
    {
        if self.pending.load(Ordering::Acquire) > self.pending_limit {
            quorus_metrics::metrics().pool_rejections.inc();
            tracing::warn!(
                "worker pool '{}' over high-water mark ({}), rejecting task",
                self.name,
                self.pending_limit
            );
            return Err(ObjectError::Unavailable);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);

        let name = self.name.clone();
        let wrapped: PoolTask = Box::pin(async move {
            if let Err(e) = task.await {
                tracing::warn!("worker pool '{}' task failed: {}", name, e);
            }
        });

        if self.tx.send(wrapped).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ObjectError::Unavailable);
        }
        Ok(())
    }

    /// Enqueue a task and await its result. The admission check is the
    /// same as [`WorkerPool::enqueue`]; the caller observes the task's own
    /// error, so the pool does not log it a second time.
    pub async fn submit<F, T>(&self, task: F) -> Result<T, ObjectError>
    where
        F: Future<Output = Result<T, ObjectError>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.enqueue(async move {
            let _ = result_tx.send(task.await);
            Ok(())
        })?;
        result_rx.await.map_err(|_| ObjectError::Unavailable)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
