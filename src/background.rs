//! Bounded fire-and-forget tasks.
//!
//! Cache fills and invalidations run off the request path. They are capped by
//! a semaphore; when the cap is reached new work is dropped rather than queued,
//! because every such task is safe to skip.

use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    limit: u32,
}

impl BackgroundTasks {
    pub fn new(limit: u32) -> Self {
        let limit = limit.max(1);
        BackgroundTasks {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
        }
    }

    /// Run `task` in the background. Its error is logged and dropped.
    ///
    /// Returns `false` when the task was not started because the limit is
    /// reached.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("⚠ Background limit reached, dropping {}", name);
                return false;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!("⚠ Background {} failed: {}", name, e);
            }
            drop(permit);
        });
        true
    }

    /// Wait until every running task has finished.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.limit).await {
            drop(all);
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        BackgroundTasks::new(256)
    }
}
