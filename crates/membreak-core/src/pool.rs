//! Bounded-parallelism worker pool with an unbounded submission queue.
//!
//! `submit` never blocks: every job is spawned immediately and parks on the
//! pool's semaphore until a slot frees up. Completed jobs are collected
//! through the underlying `JoinSet`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::trace;

pub struct WorkerPool<T> {
    name: &'static str,
    size: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Pool running at most `size` jobs at once (minimum one).
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs submitted and not yet collected.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Jobs currently holding a slot.
    pub fn busy(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    pub fn submit<F>(&mut self, job: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let name = self.name;
        self.tasks.spawn(async move {
            // Never closed, so the permit is always granted.
            let _permit = semaphore.acquire_owned().await.ok();
            trace!(pool = name, "job started");
            job.await
        });
    }

    /// Next completed job, or `None` when the pool is empty.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    /// Wait for every outstanding job. Panicked jobs are logged and skipped.
    #[cfg(test)]
    pub async fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(v) => out.push(v),
                Err(e) => {
                    tracing::warn!(pool = self.name, error = %e, "pool job did not complete")
                }
            }
        }
        out
    }
}
