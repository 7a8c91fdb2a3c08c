//! Round-robin pool of workers

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::worker::Worker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `num_workers` workers (one per CPU when unset)
    #[cfg(unix)]
    pub async fn spawn(settings: &EngineSettings) -> Result<Self> {
        let count = settings.effective_num_workers();
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            match Worker::spawn(settings).await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &workers {
                        worker.close();
                    }
                    return Err(e);
                }
            }
        }
        info!(count, "worker pool started");
        Ok(Self::from_workers(workers))
    }

    #[must_use]
    pub fn from_workers(workers: Vec<Arc<Worker>>) -> Self {
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Next live worker in round-robin order
    pub fn next_worker(&self) -> Result<Arc<Worker>> {
        let len = self.workers.len();
        for _ in 0..len {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
            let worker = &self.workers[index];
            if !worker.is_closed() {
                return Ok(Arc::clone(worker));
            }
        }
        Err(Error::WorkerFailure("no live workers".to_string()))
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn close(&self) {
        for worker in &self.workers {
            worker.close();
        }
    }
}
