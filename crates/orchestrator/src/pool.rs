//! Bounded task group used by parallel batches and fan-outs.
//!
//! Workers live in a [`JoinSet`] owned by the pool. Dropping the pool, or
//! the future awaiting [`WorkerPool::join`], aborts every worker still
//! running, so no child outlives the call that dispatched it.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info_span, Instrument};

const EXTRA_WORKERS: usize = 4;

/// How many children may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            size: cpus + EXTRA_WORKERS,
        }
    }
}

impl PoolConfig {
    pub fn with_size(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

/// Result of one worker: its output, or the message it panicked with.
pub type WorkerResult<T> = std::result::Result<T, String>;

/// Everything a pool produced once all workers are done.
#[derive(Debug)]
pub struct Joined<T> {
    /// Worker results ordered by the index given to [`WorkerPool::spawn`].
    pub completed: Vec<(usize, WorkerResult<T>)>,
    /// Failures of the task group itself (a worker aborted or lost by the
    /// runtime). Panics inside a worker are not counted here.
    pub failures: Vec<String>,
}

/// One pool per `run()`/`execute()`/`verify()` call.
pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<(usize, WorkerResult<T>)>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.size.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `work` once a permit is free. The task runs inside a `worker`
    /// span carrying `name`; a panic in `work` is caught and reported
    /// against `index`.
    pub fn spawn<F>(&mut self, index: usize, name: String, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = self.permits.clone();
        let span = info_span!("worker", name = %name);

        self.tasks.spawn(
            async move {
                // The semaphore is never closed, so acquire only fails if it is.
                let _permit = permits.acquire_owned().await.ok();
                let result = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(&*panic));
                (index, result)
            }
            .instrument(span),
        );
    }

    /// Wait for every worker.
    pub async fn join(mut self) -> Joined<T> {
        let mut completed = Vec::with_capacity(self.tasks.len());
        let mut failures = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(done) => completed.push(done),
                Err(e) => {
                    error!(error = %e, "Worker lost");
                    failures.push(e.to_string());
                }
            }
        }

        completed.sort_by_key(|(index, _)| *index);
        Joined {
            completed,
            failures,
        }
    }
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("available", &self.permits.available_permits())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
