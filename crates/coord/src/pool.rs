//! Bounded worker pool for pushes.
//!
//! Distribution and failover both submit work here, so the number of
//! offerings being pushed at once never exceeds the pool size no matter
//! which path produced them.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("job cancelled at shutdown")]
    Cancelled,
    #[error("job panicked")]
    Panicked,
}

#[derive(Debug)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a job ends, however it ends.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    cancel: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (cancel, _) = watch::channel(false);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs holding a slot right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Wait for a free slot, then run `job` on its own task.
    pub async fn spawn<F, T>(&self, job: F) -> Result<JoinHandle<Result<T, PoolError>>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.in_flight.clone());
        let mut cancel = self.cancel.subscribe();

        Ok(tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            tokio::select! {
                biased;
                out = job => Ok(out),
                _ = async {
                    if cancel.wait_for(|c| *c).await.is_err() {
                        // Pool dropped without shutdown: let the job finish.
                        std::future::pending::<()>().await;
                    }
                } => Err(PoolError::Cancelled),
            }
        }))
    }

    /// Run `job` in the pool and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.spawn(job).await?;
        handle.await.map_err(|_| PoolError::Panicked)?
    }

    /// Run every job in the pool, at most `size` at a time, and return the
    /// results in submission order.
    pub async fn run_all<I, F, T>(&self, jobs: I) -> Vec<Result<T, PoolError>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut handles = Vec::new();
        for job in jobs {
            handles.push(self.spawn(job).await);
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle {
                Ok(h) => h.await.unwrap_or(Err(PoolError::Panicked)),
                Err(e) => Err(e),
            });
        }
        results
    }

    /// Stop accepting jobs, wait up to `grace` for running ones, then cancel
    /// whatever is left. Returns `true` if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.permits.close();
        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        if !drained {
            tracing::warn!(
                "worker pool: {} job(s) still running after {:?}, cancelling",
                self.in_flight(),
                grace
            );
            self.cancel.send_replace(true);
            self.wait_idle().await;
        }
        drained
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
