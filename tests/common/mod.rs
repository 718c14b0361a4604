#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use affinity_workers::affinity::{ContextRef, Job, ManualContext};
use affinity_workers::executor::Executor;
use affinity_workers::worker::{Service, Task, WorkerState};

/// Executor that holds jobs until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queued(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn take_next(&self) -> Option<Job> {
        self.jobs.lock().unwrap().pop_front()
    }

    /// Run the oldest job on the calling thread.
    pub fn run_next(&self) -> bool {
        match self.take_next() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Run the oldest job on a new thread.
    pub fn spawn_next(&self) -> JoinHandle<()> {
        let job = self.take_next().expect("no queued job");
        thread::spawn(job)
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

pub fn manual_context() -> (Arc<ManualContext>, ContextRef) {
    let manual = ManualContext::new();
    let ctx: ContextRef = manual.clone();
    (manual, ctx)
}

/// Wait until a background thread posted something to the context.
pub fn wait_for_posts(manual: &ManualContext) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manual.pending() == 0 {
        assert!(Instant::now() < deadline, "nothing was posted in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Service whose computations block until the test feeds them a result.
pub fn gated_service(ctx: &ContextRef) -> (Service<i32>, Sender<anyhow::Result<i32>>) {
    let (tx, rx) = mpsc::channel::<anyhow::Result<i32>>();
    let rx: Arc<Mutex<Receiver<anyhow::Result<i32>>>> = Arc::new(Mutex::new(rx));
    let factory_ctx = Arc::clone(ctx);
    let service = Service::new(Arc::clone(ctx), move || {
        let rx = Arc::clone(&rx);
        Task::new(Arc::clone(&factory_ctx), move |_| {
            rx.lock().unwrap().recv().unwrap_or_else(|_| Ok(-1))
        })
    });
    (service, tx)
}

/// Service returning `value` from every run.
pub fn value_service(ctx: &ContextRef, value: i32) -> Service<i32> {
    let factory_ctx = Arc::clone(ctx);
    Service::new(Arc::clone(ctx), move || {
        Task::new(Arc::clone(&factory_ctx), move |_| Ok(value))
    })
}

pub fn record_states<V>(service: &Service<V>) -> Arc<Mutex<Vec<WorkerState>>>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    service
        .add_event_handler(move |event| sink.lock().unwrap().push(event.state))
        .unwrap();
    states
}
