//! One-shot delayed execution, used by scheduled services.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::affinity::{Job, lock};

/// Cancels a pending timer job. Cancelling after the job fired is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Schedules jobs after a delay and provides the clock they are measured on.
pub trait Timer: Send + Sync + 'static {
    /// Run `job` once after `delay`, on a timer-owned thread.
    fn schedule_once(&self, job: Job, delay: Duration) -> TimerHandle;

    /// Current time on this timer's clock.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Timer backed by a tokio runtime.
pub struct RuntimeTimer {
    handle: Handle,
}

impl RuntimeTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Timer for RuntimeTimer {
    fn schedule_once(&self, job: Job, delay: Duration) -> TimerHandle {
        let timer = TimerHandle::new();
        let token = timer.token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!("Timer job cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        job();
                    }
                }
            }
        });
        timer
    }
}

struct PendingJob {
    due: Duration,
    seq: u64,
    handle: TimerHandle,
    job: Job,
}

#[derive(Default)]
struct ManualTimerState {
    elapsed: Duration,
    next_seq: u64,
    jobs: Vec<PendingJob>,
}

/// Deterministic timer: time only moves when [`advance`](Self::advance) is
/// called, and due jobs run on the caller's thread.
pub struct ManualTimer {
    origin: Instant,
    state: Mutex<ManualTimerState>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            state: Mutex::new(ManualTimerState::default()),
        })
    }

    /// Delays of the jobs still waiting, relative to the current time,
    /// in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let state = lock(&self.state);
        let mut jobs: Vec<&PendingJob> = state
            .jobs
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .collect();
        jobs.sort_by_key(|p| p.seq);
        jobs.iter()
            .map(|p| p.due.saturating_sub(state.elapsed))
            .collect()
    }

    /// Move the clock forward and run every job that became due, earliest
    /// first. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let due_jobs = {
            let mut state = lock(&self.state);
            state.elapsed += by;
            let now = state.elapsed;
            let (mut due, waiting): (Vec<_>, Vec<_>) =
                state.jobs.drain(..).partition(|p| p.due <= now);
            state.jobs = waiting;
            due.sort_by_key(|p| (p.due, p.seq));
            due
        };

        let mut ran = 0;
        for pending in due_jobs {
            if pending.handle.is_cancelled() {
                continue;
            }
            (pending.job)();
            ran += 1;
        }
        ran
    }
}

impl Timer for ManualTimer {
    fn schedule_once(&self, job: Job, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.elapsed.saturating_add(delay);
        state.jobs.push(PendingJob {
            due,
            seq,
            handle: handle.clone(),
            job,
        });
        handle
    }

    fn now(&self) -> Instant {
        let elapsed = lock(&self.state).elapsed;
        self.origin.checked_add(elapsed).unwrap_or(self.origin)
    }
}
