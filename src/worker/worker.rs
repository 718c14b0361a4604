//! The `Worker` capability shared by tasks and services.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::WorkerError;
use crate::worker::property::{Property, ReadOnlyProperty};
use crate::worker::state::WorkerState;

/// Error recorded when a worker enters `FAILED`.
///
/// Cheap to clone; two failures are equal only when they share the same
/// underlying error.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failure({:#})", self.0)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

/// The observable fields of a worker.
pub struct WorkerProperties<V> {
    pub(crate) state: Property<WorkerState>,
    pub(crate) value: Property<Option<V>>,
    pub(crate) exception: Property<Option<Failure>>,
    pub(crate) work_done: Property<f64>,
    pub(crate) total_work: Property<f64>,
    pub(crate) progress: Property<f64>,
    pub(crate) running: Property<bool>,
    pub(crate) message: Property<String>,
    pub(crate) title: Property<String>,
}

impl<V> WorkerProperties<V>
where
    V: Clone + PartialEq + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Property::new(WorkerState::Ready),
            value: Property::new(None),
            exception: Property::new(None),
            work_done: Property::new(-1.0),
            total_work: Property::new(-1.0),
            progress: Property::new(-1.0),
            running: Property::new(false),
            message: Property::new(String::new()),
            title: Property::new(String::new()),
        }
    }

    /// Mirror every field of `source` except `running`, which each worker
    /// derives from its own state.
    pub(crate) fn bind_to(&self, source: &WorkerProperties<V>) {
        self.state.bind(&source.state);
        self.value.bind(&source.value);
        self.exception.bind(&source.exception);
        self.work_done.bind(&source.work_done);
        self.total_work.bind(&source.total_work);
        self.progress.bind(&source.progress);
        self.message.bind(&source.message);
        self.title.bind(&source.title);
    }

    pub(crate) fn unbind_all(&self) {
        self.state.unbind();
        self.value.unbind();
        self.exception.unbind();
        self.work_done.unbind();
        self.total_work.unbind();
        self.progress.unbind();
        self.message.unbind();
        self.title.unbind();
    }

    /// Restore the defaults of everything but `state`.
    pub(crate) fn clear(&self) {
        self.value.set(None);
        self.exception.set(None);
        self.work_done.set(-1.0);
        self.total_work.set(-1.0);
        self.progress.set(-1.0);
        self.running.set(false);
        self.message.set(String::new());
        self.title.set(String::new());
    }

    pub fn state(&self) -> ReadOnlyProperty<WorkerState> {
        self.state.read_only()
    }

    /// Set only on entering `SUCCEEDED` (or by `update_value`).
    pub fn value(&self) -> ReadOnlyProperty<Option<V>> {
        self.value.read_only()
    }

    /// Set only on entering `FAILED`.
    pub fn exception(&self) -> ReadOnlyProperty<Option<Failure>> {
        self.exception.read_only()
    }

    /// `-1` while indeterminate.
    pub fn work_done(&self) -> ReadOnlyProperty<f64> {
        self.work_done.read_only()
    }

    pub fn total_work(&self) -> ReadOnlyProperty<f64> {
        self.total_work.read_only()
    }

    /// `work_done / total_work`, or `-1` while indeterminate.
    pub fn progress(&self) -> ReadOnlyProperty<f64> {
        self.progress.read_only()
    }

    /// True while `SCHEDULED` or `RUNNING`.
    pub fn running(&self) -> ReadOnlyProperty<bool> {
        self.running.read_only()
    }

    pub fn message(&self) -> ReadOnlyProperty<String> {
        self.message.read_only()
    }

    pub fn title(&self) -> ReadOnlyProperty<String> {
        self.title.read_only()
    }
}

/// Read access to a worker's fields.
///
/// Once a worker has been started, every accessor must be called on the
/// affinity thread and fails with [`WorkerError::ThreadOwnership`] elsewhere.
/// Before that, any thread may read.
pub trait Worker<V>
where
    V: Clone + PartialEq + Send + 'static,
{
    /// Stable identity, carried by state-change events.
    fn worker_id(&self) -> Uuid;

    /// Thread-checked access to the observable fields.
    fn properties(&self) -> Result<&WorkerProperties<V>, WorkerError>;

    /// Request cancellation. Returns whether it was accepted.
    fn cancel(&self) -> Result<bool, WorkerError>;

    fn state(&self) -> Result<WorkerState, WorkerError> {
        Ok(self.properties()?.state.get())
    }

    fn value(&self) -> Result<Option<V>, WorkerError> {
        Ok(self.properties()?.value.get())
    }

    fn exception(&self) -> Result<Option<Failure>, WorkerError> {
        Ok(self.properties()?.exception.get())
    }

    fn work_done(&self) -> Result<f64, WorkerError> {
        Ok(self.properties()?.work_done.get())
    }

    fn total_work(&self) -> Result<f64, WorkerError> {
        Ok(self.properties()?.total_work.get())
    }

    fn progress(&self) -> Result<f64, WorkerError> {
        Ok(self.properties()?.progress.get())
    }

    fn is_running(&self) -> Result<bool, WorkerError> {
        Ok(self.properties()?.running.get())
    }

    fn message(&self) -> Result<String, WorkerError> {
        Ok(self.properties()?.message.get())
    }

    fn title(&self) -> Result<String, WorkerError> {
        Ok(self.properties()?.title.get())
    }
}
