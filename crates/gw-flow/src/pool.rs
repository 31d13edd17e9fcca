//! DispatchPool - bounded worker pool for record handlers
//!
//! - Semaphore-based concurrency cap; `submit` waits for a free worker
//! - Optional submit timeout
//! - Panics are caught at the task boundary and trip a fatal signal
//! - `release` stops intake and waits for in-flight workers

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use gw_config::DEFAULT_MAX_WORKERS;
use crate::error::PoolError;
use crate::metrics;

/// Trips once when a worker panics. The first panic message is kept.
#[derive(Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    message: Arc<Mutex<Option<String>>>,
}

impl FatalSignal {
    pub fn trip(&self, message: String) {
        {
            let mut slot = self.message.lock();
            if slot.is_none() {
                *slot = Some(message);
            }
        }
        self.token.cancel();
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    /// Resolves once the signal has tripped
    pub async fn tripped(&self) {
        self.token.cancelled().await
    }
}

pub struct DispatchPool {
    name: String,
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    submit_timeout: Option<Duration>,
    running: AtomicBool,
    active_workers: Arc<AtomicUsize>,
    fatal: FatalSignal,
}

impl DispatchPool {
    /// Create a pool; `max_workers == 0` selects the default cap
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        let max_workers = if max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            max_workers.min(u32::MAX as usize)
        };

        Self {
            name: name.into(),
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            submit_timeout: None,
            running: AtomicBool::new(true),
            active_workers: Arc::new(AtomicUsize::new(0)),
            fatal: FatalSignal::default(),
        }
    }

    pub fn with_submit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fatal_signal(&self) -> &FatalSignal {
        &self.fatal
    }

    /// Run `job` on a worker. Waits while all workers are busy.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return Err(PoolError::Closed);
        }

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match self.submit_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| PoolError::SubmitTimeout(timeout))?,
            None => acquire.await,
        }
        .map_err(|_| PoolError::Closed)?;

        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_pool_active_workers(active);

        let active_workers = Arc::clone(&self.active_workers);
        let fatal = self.fatal.clone();
        let pool_name = self.name.clone();

        tokio::spawn(async move {
            let result = AssertUnwindSafe(job).catch_unwind().await;

            if let Err(panic) = result {
                let message = panic_message(panic.as_ref());
                error!(pool = %pool_name, panic = %message, "Panic occurred in dispatch worker");
                fatal.trip(message);
            }

            let active = active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
            metrics::set_pool_active_workers(active);
            drop(permit);
        });

        Ok(())
    }

    /// Stop accepting work and wait for every in-flight worker to finish
    pub async fn release(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(pool = %self.name, active = self.active_workers(), "Releasing dispatch pool");
        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
        debug!(pool = %self.name, "Dispatch pool released");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_zero_workers_selects_default_cap() {
        assert_eq!(DispatchPool::new("test", 0).max_workers(), DEFAULT_MAX_WORKERS);
        assert_eq!(DispatchPool::new("test", 3).max_workers(), 3);
    }

    #[tokio::test]
    async fn test_submit_runs_job() {
        let pool = DispatchPool::new("test", 2);
        let (tx, rx) = oneshot::channel();

        pool.submit(async move {
            let _ = tx.send(42);
        })
        .await
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        pool.release().await;
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_submit_times_out_when_saturated() {
        let pool = DispatchPool::new("test", 1).with_submit_timeout(Some(Duration::from_millis(20)));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let err = pool.submit(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::SubmitTimeout(Duration::from_millis(20)));

        let _ = release_tx.send(());
        pool.release().await;
    }

    #[tokio::test]
    async fn test_saturated_submit_is_pending_until_a_permit_frees() {
        let pool = DispatchPool::new("test", 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let mut blocked = tokio_test::task::spawn(pool.submit(async {}));
        tokio_test::assert_pending!(blocked.poll());

        let _ = release_tx.send(());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !blocked.is_woken() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(tokio_test::assert_ready!(blocked.poll()), Ok(()));

        drop(blocked);
        pool.release().await;
    }

    #[tokio::test]
    async fn test_submit_after_release_is_rejected() {
        let pool = DispatchPool::new("test", 1);
        pool.release().await;
        assert_eq!(pool.submit(async {}).await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn test_release_waits_for_in_flight_workers() {
        let pool = DispatchPool::new("test", 4);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let done = done.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.release().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_panic_trips_fatal_signal() {
        let pool = DispatchPool::new("test", 2);

        pool.submit(async {
            panic!("handler exploded");
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), pool.fatal_signal().tripped())
            .await
            .unwrap();
        assert_eq!(pool.fatal_signal().message().as_deref(), Some("handler exploded"));

        pool.release().await;
        assert_eq!(pool.active_workers(), 0);
    }
}
