//! Bounded dispatch pool for per-message worker tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const COMPONENT: &str = "dispatch_pool";

/// Runs short-lived per-message tasks, at most `parallelism` at a time.
///
/// Permits are acquired in submission order, so a pool of size one preserves
/// delivery order into the task bodies.
pub(crate) struct DispatchPool {
    permits: Arc<Semaphore>,
    parallelism: u32,
}

impl DispatchPool {
    pub(crate) fn new(parallelism: u32) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            permits: Arc::new(Semaphore::new(parallelism as usize)),
            parallelism,
        }
    }

    /// Waits for a worker slot, then runs `task` on it.
    pub(crate) async fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            warn!(
                component = COMPONENT,
                "dispatch pool is closed; dropping task"
            );
            return;
        };
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Waits until every in-flight task has finished, up to `deadline`.
    ///
    /// Returns `false` when the deadline elapsed with work still in flight.
    pub(crate) async fn drain(&self, deadline: Duration) -> bool {
        let acquire_all = self.permits.clone().acquire_many_owned(self.parallelism);
        match tokio::time::timeout(deadline, acquire_all).await {
            Ok(Ok(_all_permits)) => true,
            Ok(Err(_closed)) => true,
            Err(_elapsed) => false,
        }
    }
}
