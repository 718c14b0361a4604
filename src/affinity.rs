//! The affinity context: the single thread that owns worker-visible state.
//!
//! The framework needs exactly two primitives from it:
//! - `is_affinity_thread()`: whether the caller is the owning thread
//! - `run_later(job)`: enqueue `job` to run later, in FIFO order, on that thread
//!
//! Two implementations are provided:
//! - [`EventLoop`]: a dedicated thread draining a job queue
//! - [`ManualContext`]: fakes the affinity thread on the thread that created
//!   it; queued jobs only run when [`ManualContext::run_pending`] is called

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};

use crate::error::WorkerError;

/// A unit of work posted across threads.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Access to the thread that owns all worker-visible state.
pub trait AffinityContext: Send + Sync + 'static {
    /// Whether the calling thread is the affinity thread.
    fn is_affinity_thread(&self) -> bool;

    /// Schedule `job` to run later on the affinity thread. Jobs run in the
    /// order they were posted. Never runs `job` inline.
    fn run_later(&self, job: Job);
}

/// Shared handle to an affinity context.
pub type ContextRef = Arc<dyn AffinityContext>;

/// A dedicated affinity thread draining a FIFO job queue.
pub struct EventLoop {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn the loop thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = name.into();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!(thread = %name, "Event loop started");
            while let Some(job) = rx.blocking_recv() {
                job();
            }
            tracing::debug!(thread = %name, "Event loop stopped");
        })?;

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Run `f` on the loop thread and block until it returns.
    ///
    /// Fails when called from the loop thread itself (it would never return)
    /// or after [`shutdown`](Self::shutdown). Must not be called from inside
    /// an async runtime.
    pub fn invoke<R, F>(&self, f: F) -> Result<R, WorkerError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_affinity_thread() {
            return Err(WorkerError::EventLoopClosed);
        }
        let (result_tx, result_rx) = oneshot::channel();
        let posted = self.post(Box::new(move || {
            let _ = result_tx.send(f());
        }));
        if !posted {
            return Err(WorkerError::EventLoopClosed);
        }
        result_rx
            .blocking_recv()
            .map_err(|_| WorkerError::EventLoopClosed)
    }

    /// Stop accepting jobs, let queued jobs finish and join the loop thread.
    pub fn shutdown(&self) {
        lock(&self.tx).take();
        if self.is_affinity_thread() {
            return;
        }
        if let Some(handle) = lock(&self.handle).take()
            && handle.join().is_err()
        {
            tracing::warn!("Event loop thread panicked");
        }
    }

    fn post(&self, job: Job) -> bool {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }
}

impl AffinityContext for EventLoop {
    fn is_affinity_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn run_later(&self, job: Job) {
        if !self.post(job) {
            tracing::warn!("Job posted to a closed event loop was dropped");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        lock(&self.tx).take();
    }
}

/// Affinity context for tests and embedders that drive their own loop.
///
/// The thread that calls [`ManualContext::new`] is the affinity thread.
/// Posted jobs accumulate until that thread calls [`run_pending`](Self::run_pending).
pub struct ManualContext {
    owner: ThreadId,
    queue: Mutex<VecDeque<Job>>,
    executed: AtomicUsize,
}

impl ManualContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            queue: Mutex::new(VecDeque::new()),
            executed: AtomicUsize::new(0),
        })
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Total number of jobs run so far.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Run queued jobs, including jobs they post, until the queue is empty.
    /// Returns how many ran.
    pub fn run_pending(&self) -> Result<usize, WorkerError> {
        if !self.is_affinity_thread() {
            return Err(WorkerError::ThreadOwnership {
                operation: "run_pending",
            });
        }
        let mut ran = 0;
        loop {
            // The lock must be released before the job runs; jobs post more jobs.
            let next = lock(&self.queue).pop_front();
            let Some(job) = next else { break };
            job();
            ran += 1;
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ran)
    }
}

impl AffinityContext for ManualContext {
    fn is_affinity_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn run_later(&self, job: Job) {
        lock(&self.queue).push_back(job);
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
