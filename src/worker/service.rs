//! Reusable controller that creates, executes and rebinds to tasks.
//!
//! Each `start()` asks the factory for a fresh [`Task`], binds the service's
//! fields to the task's, moves the task to `SCHEDULED` and hands it to the
//! executor. The service observes its own (mirrored) state and fires its
//! handlers on every change. `reset()` unbinds and clears the fields so the
//! next `start()` can bind to a new task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use uuid::Uuid;

use crate::affinity::{ContextRef, lock};
use crate::error::WorkerError;
use crate::executor::{Executor, default_executor};
use crate::worker::event::{EventHandler, EventHandlers, HandlerId};
use crate::worker::state::{WorkerState, WorkerStateEvent};
use crate::worker::task::Task;
use crate::worker::worker::{Worker, WorkerProperties};

/// Creates the task for each run of a service.
pub type TaskFactory<V> = Arc<dyn Fn() -> Task<V> + Send + Sync>;

/// Behavior layered on top of a plain service.
pub(crate) trait ServiceExtension<V>: Send + Sync {
    /// Hand a freshly scheduled task to execution, typically through
    /// [`Service::submit`].
    fn execute_task(&self, service: &Service<V>, task: Task<V>);

    /// Runs after handlers and observers saw `state`.
    fn after_transition(&self, _service: &Service<V>, _state: WorkerState) {}

    /// Runs after a public `reset()`.
    fn after_reset(&self, _service: &Service<V>) {}

    /// Runs after a public `cancel()`.
    fn after_cancel(&self, _service: &Service<V>) {}
}

struct ServiceInner<V> {
    id: Uuid,
    ctx: ContextRef,
    factory: TaskFactory<V>,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    started_once: AtomicBool,
    task: Mutex<Option<Task<V>>>,
    fields: WorkerProperties<V>,
    handlers: EventHandlers,
    extension: OnceLock<Arc<dyn ServiceExtension<V>>>,
}

/// A reusable worker running one task at a time. Clones share the service.
pub struct Service<V> {
    inner: Arc<ServiceInner<V>>,
}

impl<V> Clone for Service<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Service<V> {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }
}

impl<V> Service<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a service whose runs are produced by `factory`.
    ///
    /// The factory is invoked on the affinity thread (or the thread of the
    /// very first `start()`); the tasks it returns must share `ctx`.
    pub fn new<F>(ctx: ContextRef, factory: F) -> Self
    where
        F: Fn() -> Task<V> + Send + Sync + 'static,
    {
        let inner = Arc::new(ServiceInner {
            id: Uuid::new_v4(),
            ctx,
            factory: Arc::new(factory),
            executor: Mutex::new(None),
            started_once: AtomicBool::new(false),
            task: Mutex::new(None),
            fields: WorkerProperties::new(),
            handlers: EventHandlers::default(),
            extension: OnceLock::new(),
        });

        let weak: Weak<ServiceInner<V>> = Arc::downgrade(&inner);
        inner.fields.state.subscribe(move |_, next| {
            if let Some(inner) = weak.upgrade() {
                Service { inner }.state_changed(*next);
            }
        });

        Self { inner }
    }

    pub(crate) fn with_extension<F>(
        ctx: ContextRef,
        factory: F,
        extension: Arc<dyn ServiceExtension<V>>,
    ) -> Self
    where
        F: Fn() -> Task<V> + Send + Sync + 'static,
    {
        let service = Self::new(ctx, factory);
        // Freshly created, so the cell is empty.
        let _ = service.inner.extension.set(extension);
        service
    }

    /// Use `executor` instead of the shared default pool.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<(), WorkerError> {
        self.check_thread("set_executor")?;
        *lock(&self.inner.executor) = Some(executor);
        Ok(())
    }

    /// Start a run. Only legal in `READY`.
    ///
    /// The very first call may come from any thread; the scheduling step is
    /// then posted to the affinity thread.
    pub fn start(&self) -> Result<(), WorkerError> {
        self.check_thread("start")?;
        let state = self.inner.fields.state.get();
        if state != WorkerState::Ready {
            return Err(WorkerError::IllegalState {
                operation: "start",
                state,
            });
        }
        self.resolve_executor()?;

        let task = (self.inner.factory)();
        *lock(&self.inner.task) = Some(task.clone());
        self.inner.fields.bind_to(task.fields());
        self.inner.started_once.store(true, Ordering::SeqCst);
        tracing::info!(service_id = %self.inner.id, task_id = %task.id(), "Service starting task");

        if self.inner.ctx.is_affinity_thread() {
            self.schedule(task);
        } else {
            let service = self.clone();
            self.inner
                .ctx
                .run_later(Box::new(move || service.schedule(task)));
        }
        Ok(())
    }

    /// Cancel the current run, or move straight to `CANCELLED` when no task
    /// exists. Returns whether cancellation was accepted.
    pub fn cancel(&self) -> Result<bool, WorkerError> {
        self.check_thread("cancel")?;
        let task = lock(&self.inner.task).clone();
        let accepted = match task {
            Some(task) => task.cancel_with(true),
            None => {
                let state = self.inner.fields.state.get();
                if matches!(state, WorkerState::Cancelled | WorkerState::Succeeded) {
                    false
                } else {
                    self.inner.fields.state.set(WorkerState::Cancelled);
                    true
                }
            }
        };
        tracing::info!(service_id = %self.inner.id, accepted, "Service cancel requested");

        if let Some(extension) = self.inner.extension.get() {
            extension.after_cancel(self);
        }
        Ok(accepted)
    }

    /// Cancel whatever is in flight, reset, and start a new task.
    pub fn restart(&self) -> Result<(), WorkerError> {
        self.check_thread("restart")?;
        let previous = lock(&self.inner.task).take();
        if let Some(task) = previous {
            task.cancel_with(true);
            // The old task may refuse cancellation (already completed); the
            // service must still leave its running states.
            self.inner.fields.state.unbind();
            if self.inner.fields.state.get().is_running() {
                self.inner.fields.state.set(WorkerState::Cancelled);
            }
        }
        tracing::info!(service_id = %self.inner.id, "Service restarting");
        self.reset()?;
        self.start()
    }

    /// Return to `READY` with default field values. Illegal while
    /// `SCHEDULED` or `RUNNING`.
    pub fn reset(&self) -> Result<(), WorkerError> {
        self.check_thread("reset")?;
        self.reset_fields()?;
        if let Some(extension) = self.inner.extension.get() {
            extension.after_reset(self);
        }
        Ok(())
    }

    /// Install the handler run when the service enters `state`.
    pub fn set_on<F>(&self, state: WorkerState, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(&WorkerStateEvent) + Send + Sync + 'static,
    {
        self.check_thread("set_on")?;
        let handler: EventHandler = Arc::new(handler);
        self.inner.handlers.set_on(state, Some(handler));
        Ok(())
    }

    pub fn clear_on(&self, state: WorkerState) -> Result<(), WorkerError> {
        self.check_thread("clear_on")?;
        self.inner.handlers.set_on(state, None);
        Ok(())
    }

    /// Observe every state change.
    pub fn add_event_handler<F>(&self, handler: F) -> Result<HandlerId, WorkerError>
    where
        F: Fn(&WorkerStateEvent) + Send + Sync + 'static,
    {
        self.check_thread("add_event_handler")?;
        Ok(self.inner.handlers.add(Arc::new(handler)))
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> Result<bool, WorkerError> {
        self.check_thread("remove_event_handler")?;
        Ok(self.inner.handlers.remove(id))
    }

    /// Id of the task currently bound, if any.
    pub fn current_task_id(&self) -> Result<Option<Uuid>, WorkerError> {
        self.check_thread("current_task_id")?;
        Ok(self.task_id())
    }

    /// Id of the bound task, without the thread check.
    pub(crate) fn task_id(&self) -> Option<Uuid> {
        lock(&self.inner.task).as_ref().map(Task::id)
    }

    /// Reset without notifying the extension.
    pub(crate) fn reset_fields(&self) -> Result<(), WorkerError> {
        let fields = &self.inner.fields;
        let state = fields.state.get();
        if state.is_running() {
            return Err(WorkerError::IllegalState {
                operation: "reset",
                state,
            });
        }
        lock(&self.inner.task).take();
        fields.unbind_all();
        fields.clear();
        fields.state.set(WorkerState::Ready);
        Ok(())
    }

    /// `READY → SCHEDULED → CANCELLED` without creating a task.
    pub(crate) fn cancel_from_ready_state(&self) {
        self.inner.fields.state.set(WorkerState::Scheduled);
        self.inner.fields.state.set(WorkerState::Cancelled);
    }

    /// Give `task` to the executor now.
    pub(crate) fn submit(&self, task: Task<V>) {
        let executor = lock(&self.inner.executor).clone();
        match executor {
            Some(executor) => executor.execute(Box::new(move || task.run())),
            // resolve_executor() runs before any task exists.
            None => tracing::error!(service_id = %self.inner.id, "No executor resolved"),
        }
    }

    pub(crate) fn fields(&self) -> &WorkerProperties<V> {
        &self.inner.fields
    }

    pub(crate) fn downgrade(&self) -> WeakService<V> {
        WeakService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn context(&self) -> &ContextRef {
        &self.inner.ctx
    }

    pub(crate) fn check_thread(&self, operation: &'static str) -> Result<(), WorkerError> {
        if self.inner.started_once.load(Ordering::SeqCst) && !self.inner.ctx.is_affinity_thread()
        {
            return Err(WorkerError::ThreadOwnership { operation });
        }
        Ok(())
    }

    fn resolve_executor(&self) -> Result<(), WorkerError> {
        let mut executor = lock(&self.inner.executor);
        if executor.is_none() {
            *executor = Some(default_executor()?);
        }
        Ok(())
    }

    fn schedule(&self, task: Task<V>) {
        // Cancelled between an off-thread start() and this posted step.
        if task.is_cancelled() {
            tracing::debug!(service_id = %self.inner.id, task_id = %task.id(), "Skipping cancelled task");
            return;
        }
        task.set_state(WorkerState::Scheduled);
        match self.inner.extension.get() {
            Some(extension) => extension.execute_task(self, task),
            None => self.submit(task),
        }
    }

    /// Order: `running`, the state's handler, observers, then the extension.
    fn state_changed(&self, next: WorkerState) {
        self.inner.fields.running.set(next.is_running());
        tracing::debug!(service_id = %self.inner.id, state = %next, "Service transition");
        self.inner
            .handlers
            .dispatch(&WorkerStateEvent::new(self.inner.id, next));
        if let Some(extension) = self.inner.extension.get() {
            extension.after_transition(self, next);
        }
    }
}

impl<V> Worker<V> for Service<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn worker_id(&self) -> Uuid {
        self.inner.id
    }

    fn properties(&self) -> Result<&WorkerProperties<V>, WorkerError> {
        self.check_thread("properties")?;
        Ok(&self.inner.fields)
    }

    fn cancel(&self) -> Result<bool, WorkerError> {
        Service::cancel(self)
    }
}

/// Non-owning handle to a [`Service`], for callbacks that must not keep it
/// alive.
pub(crate) struct WeakService<V> {
    inner: Weak<ServiceInner<V>>,
}

impl<V> WeakService<V> {
    pub(crate) fn upgrade(&self) -> Option<Service<V>> {
        self.inner.upgrade().map(|inner| Service { inner })
    }
}

impl<V> std::fmt::Debug for Service<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("id", &self.inner.id).finish()
    }
}
