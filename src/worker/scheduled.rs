//! A service that restarts itself on a delay/period schedule.
//!
//! After each success the next run starts once `period` has passed since
//! the previous run started. After a failure the period is stretched by the
//! backoff strategy, until `maximum_failure_count` failures stop the
//! service in `FAILED`.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::affinity::{ContextRef, Job, lock};
use crate::config::ScheduleConfig;
use crate::error::WorkerError;
use crate::executor::Executor;
use crate::timer::{Timer, TimerHandle};
use crate::worker::backoff::{BackoffStrategy, Interval, default_strategy};
use crate::worker::event::HandlerId;
use crate::worker::property::{Property, ReadOnlyProperty};
use crate::worker::service::{Service, ServiceExtension};
use crate::worker::state::{WorkerState, WorkerStateEvent};
use crate::worker::task::Task;
use crate::worker::worker::{Worker, WorkerProperties};

struct Settings {
    delay: Interval,
    period: Interval,
    maximum_cumulative_period: Interval,
    restart_on_failure: bool,
    maximum_failure_count: u32,
    backoff: BackoffStrategy,
}

struct RunState {
    last_run_time: Option<Instant>,
    fresh_start: bool,
    /// Cancel was requested; the next success ends the schedule.
    stop: bool,
    delay_task: Option<(u64, TimerHandle)>,
    next_delay_id: u64,
}

struct Schedule<V> {
    this: Weak<Schedule<V>>,
    timer: Arc<dyn Timer>,
    settings: Mutex<Settings>,
    cumulative_period: Property<Duration>,
    current_failure_count: Property<u32>,
    last_value: Property<Option<V>>,
    run: Mutex<RunState>,
}

impl<V> Schedule<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn period(&self) -> Duration {
        lock(&self.settings).period.normalize()
    }

    fn set_cumulative_period(&self, value: Duration) {
        let max = lock(&self.settings).maximum_cumulative_period;
        self.cumulative_period.set(max.clamp(value));
    }

    fn execute_now(&self, service: &Service<V>, task: Task<V>) {
        lock(&self.run).last_run_time = Some(self.timer.now());
        service.submit(task);
    }

    fn schedule_after(&self, service: &Service<V>, task: Task<V>, delay: Duration) {
        let id = {
            let mut run = lock(&self.run);
            run.next_delay_id += 1;
            run.next_delay_id
        };
        tracing::debug!(service_id = %service.id(), delay_ms = delay.as_millis() as u64, "Delaying next run");

        let schedule = self.this.clone();
        let weak_service = service.downgrade();
        let ctx = Arc::clone(service.context());
        let job: Job = Box::new(move || {
            let fire = move || {
                if let (Some(schedule), Some(service)) = (schedule.upgrade(), weak_service.upgrade())
                {
                    schedule.delay_elapsed(id, &service, task);
                }
            };
            if ctx.is_affinity_thread() {
                fire();
            } else {
                ctx.run_later(Box::new(fire));
            }
        });

        let handle = self.timer.schedule_once(job, delay);
        lock(&self.run).delay_task = Some((id, handle));
    }

    fn delay_elapsed(&self, id: u64, service: &Service<V>, task: Task<V>) {
        let pending = {
            let mut run = lock(&self.run);
            if run.delay_task.as_ref().is_some_and(|(current, _)| *current == id) {
                run.delay_task.take()
            } else {
                None
            }
        };
        match pending {
            Some((_, handle)) if !handle.is_cancelled() => self.execute_now(service, task),
            _ => tracing::debug!(service_id = %service.id(), "Ignoring stale delayed run"),
        }
    }

    fn cancel_delay(&self) {
        if let Some((_, handle)) = lock(&self.run).delay_task.take() {
            handle.cancel();
        }
    }

    fn succeeded(&self, service: &Service<V>) {
        self.last_value.set(service.fields().value.get());
        self.set_cumulative_period(self.period());
        self.continue_later(service, WorkerState::Succeeded);
    }

    fn failed(&self, service: &Service<V>) {
        let failures = self.current_failure_count.get().saturating_add(1);
        self.current_failure_count.set(failures);

        let (restart, max_failures, backoff) = {
            let settings = lock(&self.settings);
            (
                settings.restart_on_failure,
                settings.maximum_failure_count,
                Arc::clone(&settings.backoff),
            )
        };
        let stop = lock(&self.run).stop;
        if !restart || stop || failures >= max_failures {
            tracing::info!(service_id = %service.id(), failures, "Scheduled service stopped after failure");
            return;
        }

        self.set_cumulative_period(backoff(failures, self.period()));
        tracing::info!(
            service_id = %service.id(),
            failures,
            next_ms = self.cumulative_period.get().as_millis() as u64,
            "Retrying after failure"
        );
        self.continue_later(service, WorkerState::Failed);
    }

    /// Post the next iteration so every listener sees `from` before the
    /// service moves on. Skipped if the service was reset or restarted in
    /// the meantime.
    fn continue_later(&self, service: &Service<V>, from: WorkerState) {
        let task_id = service.task_id();
        let schedule = self.this.clone();
        let weak_service = service.downgrade();
        service.context().run_later(Box::new(move || {
            let (Some(schedule), Some(service)) = (schedule.upgrade(), weak_service.upgrade())
            else {
                return;
            };
            if service.fields().state.get() != from || service.task_id() != task_id {
                tracing::debug!(service_id = %service.id(), "Schedule moved on before next iteration");
                return;
            }
            schedule.next_iteration(&service, from);
        }));
    }

    fn next_iteration(&self, service: &Service<V>, from: WorkerState) {
        let stop = lock(&self.run).stop;
        // A failure after cancel() is final.
        if stop && from == WorkerState::Failed {
            return;
        }
        if let Err(e) = service.reset_fields() {
            tracing::warn!(service_id = %service.id(), error = %e, "Could not reset between iterations");
            return;
        }
        if stop {
            tracing::info!(service_id = %service.id(), "Schedule cancelled during run");
            service.cancel_from_ready_state();
        } else if let Err(e) = service.start() {
            tracing::warn!(service_id = %service.id(), error = %e, "Could not start next iteration");
        }
    }
}

impl<V> ServiceExtension<V> for Schedule<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn execute_task(&self, service: &Service<V>, task: Task<V>) {
        let (fresh, last_run) = {
            let mut run = lock(&self.run);
            let fresh = run.fresh_start;
            run.fresh_start = false;
            (fresh, run.last_run_time)
        };

        if fresh {
            let delay = lock(&self.settings).delay.normalize();
            self.set_cumulative_period(self.period());
            if delay.is_zero() {
                self.execute_now(service, task);
            } else {
                self.schedule_after(service, task, delay);
            }
            return;
        }

        let cumulative = self.cumulative_period.get();
        let elapsed = last_run
            .map(|t| self.timer.now().saturating_duration_since(t))
            .unwrap_or(Duration::MAX);
        if elapsed >= cumulative {
            self.execute_now(service, task);
        } else {
            self.schedule_after(service, task, cumulative - elapsed);
        }
    }

    fn after_transition(&self, service: &Service<V>, state: WorkerState) {
        match state {
            WorkerState::Succeeded => self.succeeded(service),
            WorkerState::Failed => self.failed(service),
            _ => {}
        }
    }

    fn after_reset(&self, _service: &Service<V>) {
        {
            let mut run = lock(&self.run);
            run.stop = false;
            run.last_run_time = None;
            run.fresh_start = true;
        }
        self.cancel_delay();
        self.set_cumulative_period(self.period());
        self.last_value.set(None);
        self.current_failure_count.set(0);
    }

    fn after_cancel(&self, _service: &Service<V>) {
        lock(&self.run).stop = true;
        self.cancel_delay();
    }
}

/// A [`Service`] that re-runs its task on a schedule. Clones share the
/// service.
pub struct ScheduledService<V> {
    service: Service<V>,
    schedule: Arc<Schedule<V>>,
}

impl<V> Clone for ScheduledService<V> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            schedule: Arc::clone(&self.schedule),
        }
    }
}

impl<V> ScheduledService<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<F>(ctx: ContextRef, timer: Arc<dyn Timer>, factory: F) -> Self
    where
        F: Fn() -> Task<V> + Send + Sync + 'static,
    {
        Self::with_config(ctx, timer, ScheduleConfig::default(), factory)
    }

    pub fn with_config<F>(
        ctx: ContextRef,
        timer: Arc<dyn Timer>,
        config: ScheduleConfig,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Task<V> + Send + Sync + 'static,
    {
        let schedule = Arc::new_cyclic(|this| Schedule {
            this: this.clone(),
            timer,
            cumulative_period: Property::new(
                config
                    .maximum_cumulative_period
                    .clamp(config.period.normalize()),
            ),
            settings: Mutex::new(Settings {
                delay: config.delay,
                period: config.period,
                maximum_cumulative_period: config.maximum_cumulative_period,
                restart_on_failure: config.restart_on_failure,
                maximum_failure_count: config.maximum_failure_count,
                backoff: default_strategy(),
            }),
            current_failure_count: Property::new(0),
            last_value: Property::new(None),
            run: Mutex::new(RunState {
                last_run_time: None,
                fresh_start: true,
                stop: false,
                delay_task: None,
                next_delay_id: 0,
            }),
        });
        let extension: Arc<dyn ServiceExtension<V>> = schedule.clone();
        let service = Service::with_extension(ctx, factory, extension);
        Self { service, schedule }
    }

    /// The underlying service.
    pub fn service(&self) -> &Service<V> {
        &self.service
    }

    pub fn id(&self) -> Uuid {
        self.service.id()
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        self.service.start()
    }

    /// Cancel the current run and stop the schedule. A run whose result is
    /// already on its way ends the schedule in `CANCELLED` once it lands.
    pub fn cancel(&self) -> Result<bool, WorkerError> {
        self.service.cancel()
    }

    /// Back to `READY` with a fresh schedule: failure count, last value and
    /// cumulative period are reset as well.
    pub fn reset(&self) -> Result<(), WorkerError> {
        self.service.reset()
    }

    pub fn restart(&self) -> Result<(), WorkerError> {
        self.service.restart()
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<(), WorkerError> {
        self.service.set_executor(executor)
    }

    pub fn set_on<F>(&self, state: WorkerState, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(&WorkerStateEvent) + Send + Sync + 'static,
    {
        self.service.set_on(state, handler)
    }

    pub fn clear_on(&self, state: WorkerState) -> Result<(), WorkerError> {
        self.service.clear_on(state)
    }

    pub fn add_event_handler<F>(&self, handler: F) -> Result<HandlerId, WorkerError>
    where
        F: Fn(&WorkerStateEvent) + Send + Sync + 'static,
    {
        self.service.add_event_handler(handler)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> Result<bool, WorkerError> {
        self.service.remove_event_handler(id)
    }

    pub fn delay(&self) -> Result<Interval, WorkerError> {
        self.service.check_thread("delay")?;
        Ok(lock(&self.schedule.settings).delay)
    }

    /// Wait applied before the first run of a fresh start.
    pub fn set_delay(&self, delay: Interval) -> Result<(), WorkerError> {
        self.service.check_thread("set_delay")?;
        lock(&self.schedule.settings).delay = delay;
        Ok(())
    }

    pub fn period(&self) -> Result<Interval, WorkerError> {
        self.service.check_thread("period")?;
        Ok(lock(&self.schedule.settings).period)
    }

    /// Takes effect from the next start or success.
    pub fn set_period(&self, period: Interval) -> Result<(), WorkerError> {
        self.service.check_thread("set_period")?;
        lock(&self.schedule.settings).period = period;
        Ok(())
    }

    pub fn maximum_cumulative_period(&self) -> Result<Interval, WorkerError> {
        self.service.check_thread("maximum_cumulative_period")?;
        Ok(lock(&self.schedule.settings).maximum_cumulative_period)
    }

    pub fn set_maximum_cumulative_period(&self, max: Interval) -> Result<(), WorkerError> {
        self.service.check_thread("set_maximum_cumulative_period")?;
        lock(&self.schedule.settings).maximum_cumulative_period = max;
        Ok(())
    }

    pub fn restart_on_failure(&self) -> Result<bool, WorkerError> {
        self.service.check_thread("restart_on_failure")?;
        Ok(lock(&self.schedule.settings).restart_on_failure)
    }

    pub fn set_restart_on_failure(&self, restart: bool) -> Result<(), WorkerError> {
        self.service.check_thread("set_restart_on_failure")?;
        lock(&self.schedule.settings).restart_on_failure = restart;
        Ok(())
    }

    pub fn maximum_failure_count(&self) -> Result<u32, WorkerError> {
        self.service.check_thread("maximum_failure_count")?;
        Ok(lock(&self.schedule.settings).maximum_failure_count)
    }

    pub fn set_maximum_failure_count(&self, count: u32) -> Result<(), WorkerError> {
        self.service.check_thread("set_maximum_failure_count")?;
        lock(&self.schedule.settings).maximum_failure_count = count;
        Ok(())
    }

    /// Replace the backoff strategy (logarithmic by default).
    pub fn set_backoff_strategy<F>(&self, strategy: F) -> Result<(), WorkerError>
    where
        F: Fn(u32, Duration) -> Duration + Send + Sync + 'static,
    {
        self.service.check_thread("set_backoff_strategy")?;
        lock(&self.schedule.settings).backoff = Arc::new(strategy);
        Ok(())
    }

    /// Current spacing between run starts, including backoff.
    pub fn cumulative_period(&self) -> Result<Duration, WorkerError> {
        self.service.check_thread("cumulative_period")?;
        Ok(self.schedule.cumulative_period.get())
    }

    pub fn cumulative_period_property(&self) -> Result<ReadOnlyProperty<Duration>, WorkerError> {
        self.service.check_thread("cumulative_period_property")?;
        Ok(self.schedule.cumulative_period.read_only())
    }

    /// Consecutive failures since the last manual reset.
    pub fn current_failure_count(&self) -> Result<u32, WorkerError> {
        self.service.check_thread("current_failure_count")?;
        Ok(self.schedule.current_failure_count.get())
    }

    /// Value of the last successful run. Survives the per-run reset.
    pub fn last_value(&self) -> Result<Option<V>, WorkerError> {
        self.service.check_thread("last_value")?;
        Ok(self.schedule.last_value.get())
    }

    pub fn last_value_property(&self) -> Result<ReadOnlyProperty<Option<V>>, WorkerError> {
        self.service.check_thread("last_value_property")?;
        Ok(self.schedule.last_value.read_only())
    }
}

impl<V> Worker<V> for ScheduledService<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn worker_id(&self) -> Uuid {
        self.service.id()
    }

    fn properties(&self) -> Result<&WorkerProperties<V>, WorkerError> {
        self.service.properties()
    }

    fn cancel(&self) -> Result<bool, WorkerError> {
        self.service.cancel()
    }
}

impl<V> std::fmt::Debug for ScheduledService<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledService")
            .field("id", &self.service.id())
            .finish()
    }
}
