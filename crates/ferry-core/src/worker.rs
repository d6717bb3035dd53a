use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task;

use crate::errors::{TransferError, TransferResult};

/// Bounded pool for blocking work: provider I/O, archive building, splitting.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run `job` on the blocking pool once a slot is free.
    pub async fn run<T, F>(&self, label: &str, job: F) -> TransferResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Worker(format!("{label}: worker pool closed")))?;
        task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| TransferError::Worker(format!("{label} worker failed: {err}")))
    }
}
