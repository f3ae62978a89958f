//! Bounded worker pool for protocol work.
//!
//! Frame handling (decryption, state changes, encryption of replies) runs
//! on tokio's blocking threads, at most `size` jobs at once. Admission is
//! bounded by `size + queue_capacity`; what happens beyond that depends on
//! the [`OverflowPolicy`].

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};

use salty_core::{Dispatcher, Job};

use crate::config::{OverflowPolicy, WorkersConfig};
use crate::error::PoolError;

/// Fixed-size pool running jobs off the I/O threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handle: Handle,
    workers: Semaphore,
    admission: Semaphore,
    size: usize,
    overflow: OverflowPolicy,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.inner.size)
            .field("busy", &self.busy())
            .field("overflow", &self.inner.overflow)
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool spawning onto `handle`.
    pub fn new(config: &WorkersConfig, handle: Handle) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                handle,
                workers: Semaphore::new(size),
                admission: Semaphore::new(size.saturating_add(config.queue_capacity)),
                size,
                overflow: config.overflow,
            }),
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Jobs currently running.
    pub fn busy(&self) -> usize {
        self.inner.size - self.inner.workers.available_permits()
    }

    /// Run `job` on a worker and return its value.
    ///
    /// Waits for admission under the `block` policy; fails with
    /// [`PoolError::Saturated`] under `drop` when the queue is full.
    pub async fn execute<F, R>(&self, job: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _admitted = match self.inner.overflow {
            OverflowPolicy::Block => self
                .inner
                .admission
                .acquire()
                .await
                .map_err(|_| PoolError::Closed)?,
            OverflowPolicy::Drop => {
                self.inner
                    .admission
                    .try_acquire()
                    .map_err(|e| match e {
                        TryAcquireError::NoPermits => PoolError::Saturated,
                        TryAcquireError::Closed => PoolError::Closed,
                    })?
            }
        };
        self.run(job).await
    }

    /// Stop admitting work. Running jobs finish; waiting ones fail with
    /// [`PoolError::Closed`].
    pub fn close(&self) {
        self.inner.admission.close();
        self.inner.workers.close();
    }

    async fn run<F, R>(&self, job: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _worker = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;

        match self.inner.handle.spawn_blocking(job).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                tracing::error!("Worker job panicked: {}", e);
                Err(PoolError::Panicked)
            }
            Err(_) => Err(PoolError::Closed),
        }
    }
}

/// Deferred jobs (notifications, `server-auth`) come from work that was
/// already admitted, so they only wait for a worker and are never dropped
/// for saturation.
impl Dispatcher for WorkerPool {
    fn dispatch(&self, job: Job) {
        let pool = self.clone();
        self.inner.handle.spawn(async move {
            if let Err(e) = pool.run(job).await {
                tracing::warn!("Deferred job not run: {}", e);
            }
        });
    }
}
