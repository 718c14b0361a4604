//! One-shot background computation with observable progress and result.
//!
//! A [`Task`] wraps a closure run once by an executor. The closure receives a
//! [`TaskContext`], the only handle a background thread may use: it
//! publishes progress, message, title and intermediate values through
//! coalescing bridges, and exposes the cancellation token.
//!
//! State always advances `READY → SCHEDULED → RUNNING → terminal`, with every
//! transition applied on the affinity thread. `CANCELLED` is sticky: later
//! transition requests are dropped silently, since a cancel racing a
//! completing computation is expected.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::affinity::{ContextRef, lock};
use crate::error::{Cancelled, TaskPanicked, WorkerError};
use crate::worker::bridge::AffinityPropertyBridge;
use crate::worker::event::{EventHandler, EventHandlers, HandlerId};
use crate::worker::state::{WorkerState, WorkerStateEvent};
use crate::worker::worker::{Failure, Worker, WorkerProperties};

type Compute<V> = Box<dyn FnOnce(&TaskContext<V>) -> anyhow::Result<V> + Send + 'static>;

/// Outcome of the underlying future, independent of the observable state.
const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

struct TaskInner<V> {
    id: Uuid,
    ctx: ContextRef,
    compute: Mutex<Option<Compute<V>>>,
    token: CancellationToken,
    outcome: AtomicU8,
    started: AtomicBool,
    runner: Mutex<Option<Thread>>,
    fields: WorkerProperties<V>,
    handlers: EventHandlers,
    progress_update: AffinityPropertyBridge<(f64, f64)>,
    message_update: AffinityPropertyBridge<String>,
    title_update: AffinityPropertyBridge<String>,
    value_update: AffinityPropertyBridge<V>,
}

/// A one-shot background computation. Clones share the same task.
pub struct Task<V> {
    inner: Arc<TaskInner<V>>,
}

impl<V> Clone for Task<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Task<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Wrap `compute`. The task may be configured from any thread until it
    /// starts running.
    pub fn new<F>(ctx: ContextRef, compute: F) -> Self
    where
        F: FnOnce(&TaskContext<V>) -> anyhow::Result<V> + Send + 'static,
    {
        let fields = WorkerProperties::new();

        let (work_done, total_work, progress) = (
            fields.work_done.clone(),
            fields.total_work.clone(),
            fields.progress.clone(),
        );
        let progress_update = AffinityPropertyBridge::new(Arc::clone(&ctx), move |(done, total)| {
            total_work.set(total);
            work_done.set(done);
            progress.set(progress_ratio(done, total));
        });

        let message = fields.message.clone();
        let message_update =
            AffinityPropertyBridge::new(Arc::clone(&ctx), move |m: String| message.set(m));

        let title = fields.title.clone();
        let title_update =
            AffinityPropertyBridge::new(Arc::clone(&ctx), move |t: String| title.set(t));

        let value = fields.value.clone();
        let value_update =
            AffinityPropertyBridge::new(Arc::clone(&ctx), move |v: V| value.set(Some(v)));

        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4(),
                ctx,
                compute: Mutex::new(Some(Box::new(compute))),
                token: CancellationToken::new(),
                outcome: AtomicU8::new(PENDING),
                started: AtomicBool::new(false),
                runner: Mutex::new(None),
                fields,
                handlers: EventHandlers::default(),
                progress_update,
                message_update,
                title_update,
                value_update,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Execute the computation on the calling (executor) thread.
    ///
    /// Posts `SCHEDULED` then `RUNNING` before computing, then either the
    /// value followed by `SUCCEEDED`, or the error followed by `FAILED`.
    /// Nothing is published once the task has been cancelled. A second call
    /// does nothing.
    pub fn run(&self) {
        let compute = lock(&self.inner.compute).take();
        let Some(compute) = compute else {
            tracing::warn!(task_id = %self.inner.id, "Task::run called more than once");
            return;
        };
        if self.inner.outcome.load(Ordering::SeqCst) != PENDING {
            tracing::debug!(task_id = %self.inner.id, "Task cancelled before it ran");
            return;
        }

        self.inner.started.store(true, Ordering::SeqCst);
        *lock(&self.inner.runner) = Some(thread::current());

        let task = self.clone();
        self.inner.ctx.run_later(Box::new(move || {
            task.set_state(WorkerState::Scheduled);
            task.set_state(WorkerState::Running);
        }));

        let task_ctx = TaskContext { task: self.clone() };
        let result = match panic::catch_unwind(AssertUnwindSafe(|| compute(&task_ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(task_id = %self.inner.id, %message, "Task computation panicked");
                Err(anyhow::Error::new(TaskPanicked { message }))
            }
        };
        lock(&self.inner.runner).take();

        if !self.complete() {
            tracing::debug!(task_id = %self.inner.id, "Discarding result of cancelled task");
            return;
        }

        let task = self.clone();
        match result {
            Ok(value) => self.inner.ctx.run_later(Box::new(move || {
                // The value must be visible before observers see SUCCEEDED.
                task.inner.fields.value.set(Some(value));
                task.set_state(WorkerState::Succeeded);
            })),
            Err(error) => self.inner.ctx.run_later(Box::new(move || {
                task.inner.fields.exception.set(Some(Failure::new(error)));
                task.set_state(WorkerState::Failed);
            })),
        }
    }

    /// Request cancellation from any thread.
    ///
    /// Accepted unless the computation already completed or was cancelled.
    /// When accepted, the cancellation token fires, the running thread is
    /// woken from [`TaskContext::sleep`] if `may_interrupt`, and the state
    /// moves to `CANCELLED`: immediately on the affinity thread, otherwise
    /// by a posted job.
    pub fn cancel_with(&self, may_interrupt: bool) -> bool {
        let accepted = self
            .inner
            .outcome
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !accepted {
            return false;
        }

        self.inner.token.cancel();
        if may_interrupt && let Some(runner) = lock(&self.inner.runner).as_ref() {
            runner.unpark();
        }

        if self.inner.ctx.is_affinity_thread() {
            self.set_state(WorkerState::Cancelled);
        } else {
            let task = self.clone();
            self.inner
                .ctx
                .run_later(Box::new(move || task.set_state(WorkerState::Cancelled)));
        }
        true
    }

    /// Whether cancellation was accepted.
    pub fn is_cancelled(&self) -> bool {
        self.inner.outcome.load(Ordering::SeqCst) == CANCELLED
    }

    /// Whether the computation completed or was cancelled.
    pub fn is_done(&self) -> bool {
        self.inner.outcome.load(Ordering::SeqCst) != PENDING
    }

    /// Publish progress. Infinite or NaN inputs and negative values become
    /// `-1` (indeterminate); `work_done` is clamped to `max`.
    pub fn update_progress(&self, work_done: f64, max: f64) {
        self.inner
            .progress_update
            .publish(normalize_progress(work_done, max));
    }

    pub fn update_message(&self, message: impl Into<String>) {
        self.inner.message_update.publish(message.into());
    }

    pub fn update_title(&self, title: impl Into<String>) {
        self.inner.title_update.publish(title.into());
    }

    /// Publish an intermediate value before the computation returns.
    pub fn update_value(&self, value: V) {
        self.inner.value_update.publish(value);
    }

    /// Install the handler run when the task enters `state`, replacing any
    /// previous one.
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

    /// Apply a transition on the affinity thread.
    ///
    /// Order: state, `running`, the state's handler, then observers.
    pub(crate) fn set_state(&self, next: WorkerState) {
        let fields = &self.inner.fields;
        let current = fields.state.get();

        if current == WorkerState::Cancelled {
            tracing::debug!(task_id = %self.inner.id, to = %next, "Dropping transition of cancelled task");
            return;
        }
        if current == next {
            return;
        }
        if next == WorkerState::Ready || !current.can_transition_to(next) {
            tracing::warn!(task_id = %self.inner.id, from = %current, to = %next, "Rejected task transition");
            return;
        }

        fields.state.set(next);
        fields.running.set(next.is_running());
        tracing::debug!(task_id = %self.inner.id, from = %current, to = %next, "Task transition");
        self.inner
            .handlers
            .dispatch(&WorkerStateEvent::new(self.inner.id, next));
    }

    pub(crate) fn fields(&self) -> &WorkerProperties<V> {
        &self.inner.fields
    }

    fn complete(&self) -> bool {
        self.inner
            .outcome
            .compare_exchange(PENDING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn check_thread(&self, operation: &'static str) -> Result<(), WorkerError> {
        if self.inner.started.load(Ordering::SeqCst) && !self.inner.ctx.is_affinity_thread() {
            return Err(WorkerError::ThreadOwnership { operation });
        }
        Ok(())
    }
}

impl<V> Worker<V> for Task<V>
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
        Ok(self.cancel_with(true))
    }
}

impl<V> std::fmt::Debug for Task<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("outcome", &self.inner.outcome.load(Ordering::SeqCst))
            .finish()
    }
}

/// Handle given to a running computation.
pub struct TaskContext<V> {
    task: Task<V>,
}

impl<V> TaskContext<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn task_id(&self) -> Uuid {
        self.task.id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.inner.token.is_cancelled()
    }

    /// Token fired when cancellation is accepted.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.task.inner.token
    }

    /// `Err(Cancelled)` once cancellation was requested, for use with `?`.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block the computation for `duration`, returning early with
    /// `Err(Cancelled)` when the task is cancelled with interruption.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_timeout(deadline - now);
        }
    }

    pub fn update_progress(&self, work_done: f64, max: f64) {
        self.task.update_progress(work_done, max);
    }

    pub fn update_message(&self, message: impl Into<String>) {
        self.task.update_message(message);
    }

    pub fn update_title(&self, title: impl Into<String>) {
        self.task.update_title(title);
    }

    pub fn update_value(&self, value: V) {
        self.task.update_value(value);
    }
}

/// Clamp a progress pair into `({-1} ∪ [0, max], {-1} ∪ [0, ∞))`.
pub(crate) fn normalize_progress(work_done: f64, max: f64) -> (f64, f64) {
    let mut work_done = if work_done.is_finite() && work_done >= 0.0 {
        work_done
    } else {
        -1.0
    };
    let max = if max.is_finite() && max >= 0.0 { max } else { -1.0 };
    if work_done > max {
        work_done = max;
    }
    (work_done, max)
}

/// `-1` when indeterminate; zero total work counts as complete.
pub(crate) fn progress_ratio(work_done: f64, max: f64) -> f64 {
    if work_done < 0.0 {
        -1.0
    } else if max == 0.0 {
        1.0
    } else {
        work_done / max
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::affinity::ManualContext;

    fn context() -> (Arc<ManualContext>, ContextRef) {
        let manual = ManualContext::new();
        let ctx: ContextRef = manual.clone();
        (manual, ctx)
    }

    fn record_states(task: &Task<i32>) -> Arc<Mutex<Vec<WorkerState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.add_event_handler(move |event| sink.lock().unwrap().push(event.state))
            .unwrap();
        seen
    }

    #[test]
    fn normalize_handles_non_finite_and_negative() {
        assert_eq!(normalize_progress(f64::NAN, 10.0), (-1.0, 10.0));
        assert_eq!(normalize_progress(5.0, f64::INFINITY), (-1.0, -1.0));
        assert_eq!(normalize_progress(-3.0, 10.0), (-1.0, 10.0));
        assert_eq!(normalize_progress(15.0, 10.0), (10.0, 10.0));
        assert_eq!(normalize_progress(4.0, -2.0), (-1.0, -1.0));
        assert_eq!(normalize_progress(f64::NEG_INFINITY, f64::NAN), (-1.0, -1.0));
    }

    #[test]
    fn normalized_progress_stays_in_range() {
        let samples = [
            f64::NAN,
            f64::INFINITY,
            f64::NEG_INFINITY,
            -1e9,
            -1.0,
            -0.5,
            0.0,
            0.25,
            1.0,
            7.0,
            1e12,
        ];
        for &done in &samples {
            for &max in &samples {
                let (d, m) = normalize_progress(done, max);
                assert!(d == -1.0 || (0.0..=m).contains(&d), "done {done} max {max} -> {d}");
                let p = progress_ratio(d, m);
                assert!(p == -1.0 || (0.0..=1.0).contains(&p), "done {done} max {max} -> {p}");
            }
        }
    }

    #[test]
    fn success_walks_full_lifecycle() {
        let (manual, ctx) = context();
        let task = Task::new(ctx, |c: &TaskContext<i32>| {
            c.update_progress(5.0, 10.0);
            c.update_progress(5.0, 10.0);
            c.update_progress(10.0, 10.0);
            Ok(42)
        });
        let seen = record_states(&task);

        task.run();
        manual.run_pending().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkerState::Scheduled, WorkerState::Running, WorkerState::Succeeded]
        );
        assert_eq!(task.state().unwrap(), WorkerState::Succeeded);
        assert_eq!(task.value().unwrap(), Some(42));
        assert_eq!(task.progress().unwrap(), 1.0);
        assert_eq!(task.work_done().unwrap(), task.total_work().unwrap());
        assert!(!task.is_running().unwrap());
    }

    #[test]
    fn error_is_recorded_before_failed() {
        let (manual, ctx) = context();
        let task = Task::new(ctx, |_: &TaskContext<i32>| anyhow::bail!("disk on fire"));

        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let probe = task.clone();
        task.set_on(WorkerState::Failed, move |_| {
            *sink.lock().unwrap() = probe.exception().unwrap().map(|f| f.to_string());
        })
        .unwrap();

        task.run();
        manual.run_pending().unwrap();

        assert_eq!(task.state().unwrap(), WorkerState::Failed);
        assert_eq!(observed.lock().unwrap().as_deref(), Some("disk on fire"));
        assert_eq!(task.value().unwrap(), None);
    }

    #[test]
    fn panic_becomes_failure() {
        let (manual, ctx) = context();
        let task = Task::new(ctx, |_: &TaskContext<i32>| panic!("kaboom"));
        task.run();
        manual.run_pending().unwrap();

        assert_eq!(task.state().unwrap(), WorkerState::Failed);
        let failure = task.exception().unwrap().unwrap();
        assert!(failure.error().downcast_ref::<TaskPanicked>().is_some());
        assert!(failure.to_string().contains("kaboom"));
    }

    #[test]
    fn cancel_before_run_skips_computation() {
        let (manual, ctx) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(ctx, move |_: &TaskContext<i32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        let seen = record_states(&task);

        assert!(task.cancel_with(false));
        assert!(!task.cancel_with(true));
        task.run();
        manual.run_pending().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), vec![WorkerState::Cancelled]);
        assert!(task.is_cancelled());
    }

    #[test]
    fn cancel_during_compute_discards_result() {
        let (manual, ctx) = context();
        let slot: Arc<Mutex<Option<Task<i32>>>> = Arc::new(Mutex::new(None));
        let handle = Arc::clone(&slot);
        let task = Task::new(ctx, move |c: &TaskContext<i32>| {
            if let Some(me) = handle.lock().unwrap().as_ref() {
                me.cancel_with(true);
            }
            assert!(c.is_cancelled());
            Ok(99)
        });
        *slot.lock().unwrap() = Some(task.clone());
        let seen = record_states(&task);

        task.run();
        manual.run_pending().unwrap();

        assert_eq!(task.state().unwrap(), WorkerState::Cancelled);
        assert_eq!(task.value().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), vec![WorkerState::Cancelled]);
    }

    #[test]
    fn cancel_after_completion_is_refused() {
        let (manual, ctx) = context();
        let task = Task::new(ctx, |_: &TaskContext<i32>| Ok(5));
        task.run();
        assert!(!task.cancel_with(true));
        manual.run_pending().unwrap();
        assert_eq!(task.state().unwrap(), WorkerState::Succeeded);
    }

    #[test]
    fn second_run_is_ignored() {
        let (manual, ctx) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(ctx, move |_: &TaskContext<i32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        task.run();
        task.run();
        manual.run_pending().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn updates_from_affinity_thread_apply_immediately() {
        let (manual, ctx) = context();
        let task: Task<i32> = Task::new(ctx, |_| Ok(0));
        task.update_message("hello");
        task.update_title("greeting");
        task.update_progress(1.0, 4.0);
        task.update_value(3);

        assert_eq!(manual.pending(), 0);
        assert_eq!(task.message().unwrap(), "hello");
        assert_eq!(task.title().unwrap(), "greeting");
        assert_eq!(task.progress().unwrap(), 0.25);
        assert_eq!(task.value().unwrap(), Some(3));
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let (_manual, ctx) = context();
        let task: Task<i32> = Task::new(ctx, |_| Ok(0));
        let task_ctx = TaskContext { task: task.clone() };
        assert!(task_ctx.checkpoint().is_ok());
        task.cancel_with(false);
        assert_eq!(task_ctx.checkpoint(), Err(Cancelled));
        assert_eq!(task_ctx.sleep(Duration::from_secs(60)), Err(Cancelled));
    }
}
