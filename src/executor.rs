//! Executors that run task computations off the affinity thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Handle, Runtime};

use crate::affinity::Job;
use crate::config::PoolConfig;
use crate::error::WorkerError;

/// Accepts jobs for background execution. Must tolerate concurrent
/// submission.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Bounded pool of detached background threads.
///
/// Backed by the blocking pool of a private tokio runtime: a new thread is
/// started for each job while fewer than `max_threads` are alive and none is
/// idle, and jobs only queue once the pool is at capacity. Idle threads exit
/// after `keep_alive`. Threads never keep the process alive.
pub struct ThreadPool {
    runtime: Runtime,
    max_threads: usize,
}

impl ThreadPool {
    pub fn new(config: &PoolConfig) -> Result<Self, WorkerError> {
        let prefix = config.thread_name_prefix.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_threads.max(1))
            .thread_keep_alive(config.keep_alive)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{n}")
            })
            .enable_time()
            .build()
            .map_err(|e| WorkerError::Executor(e.to_string()))?;

        tracing::debug!(max_threads = config.max_threads, "Worker pool created");

        Ok(Self {
            runtime,
            max_threads: config.max_threads,
        })
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Handle to the pool's runtime, for timers sharing its threads.
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        // The join handle is dropped: the job runs detached.
        drop(self.runtime.spawn_blocking(job));
    }
}

static DEFAULT_POOL: OnceLock<Result<Arc<ThreadPool>, WorkerError>> = OnceLock::new();

/// The process-wide pool used by services without an explicit executor.
///
/// Built on first use from [`PoolConfig::from_env`], falling back to the
/// defaults when the environment is invalid.
pub fn default_pool() -> Result<Arc<ThreadPool>, WorkerError> {
    DEFAULT_POOL
        .get_or_init(|| {
            let config = PoolConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring invalid pool configuration");
                PoolConfig::default()
            });
            ThreadPool::new(&config).map(Arc::new)
        })
        .clone()
}

/// [`default_pool`] as an executor trait object.
pub fn default_executor() -> Result<Arc<dyn Executor>, WorkerError> {
    default_pool().map(|pool| pool as Arc<dyn Executor>)
}
