mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use affinity_workers::affinity::{ContextRef, EventLoop};
use affinity_workers::config::{PoolConfig, ScheduleConfig};
use affinity_workers::error::WorkerError;
use affinity_workers::executor::ThreadPool;
use affinity_workers::timer::RuntimeTimer;
use affinity_workers::worker::{
    Interval, ScheduledService, Service, Task, Worker, WorkerState, WorkerStateEvent,
};

use common::manual_context;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn background_updates_coalesce_into_one_drain() {
    let (manual, ctx) = manual_context();
    let task = Task::new(Arc::clone(&ctx), |task| {
        for message in ["a", "b", "c"] {
            task.update_message(message);
        }
        for step in 1..=100u32 {
            task.update_progress(f64::from(step), 100.0);
        }
        Ok(1)
    });

    let messages = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&messages);
    task.properties()
        .unwrap()
        .message()
        .subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let runner = task.clone();
    thread::spawn(move || runner.run()).join().unwrap();

    // Scheduled/running, one message drain, one progress drain, the result.
    assert_eq!(manual.pending(), 4);
    manual.run_pending().unwrap();

    assert_eq!(task.message().unwrap(), "c");
    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(task.progress().unwrap(), 1.0);
    assert_eq!(task.state().unwrap(), WorkerState::Succeeded);
}

fn pool(max_threads: usize) -> Arc<ThreadPool> {
    Arc::new(
        ThreadPool::new(&PoolConfig {
            max_threads,
            ..PoolConfig::default()
        })
        .unwrap(),
    )
}

fn wait_for(events: &mpsc::Receiver<WorkerStateEvent>, state: WorkerState) {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("no {state} event in time"));
        if event.state == state {
            return;
        }
    }
}

#[test]
fn service_on_event_loop_and_pool() {
    let event_loop = EventLoop::spawn("test-affinity").unwrap();
    let ctx: ContextRef = event_loop.clone();
    let factory_ctx = Arc::clone(&ctx);
    let service = Service::new(ctx, move || {
        Task::new(Arc::clone(&factory_ctx), |task| {
            for step in 1..=4u32 {
                task.sleep(Duration::from_millis(5))?;
                task.update_progress(f64::from(step), 4.0);
            }
            Ok(42)
        })
    });

    let (tx, events) = mpsc::channel();
    let handle = service.clone();
    let executor = pool(2);
    event_loop
        .invoke(move || -> Result<(), WorkerError> {
            handle.set_executor(executor)?;
            handle.add_event_handler(move |event| {
                let _ = tx.send(event.clone());
            })?;
            handle.start()
        })
        .unwrap()
        .unwrap();

    wait_for(&events, WorkerState::Succeeded);

    // Off the loop thread the service refuses access once started.
    assert!(matches!(
        service.state(),
        Err(WorkerError::ThreadOwnership { .. })
    ));

    let handle = service.clone();
    let (value, progress) = event_loop
        .invoke(move || (handle.value(), handle.progress()))
        .unwrap();
    assert_eq!(value.unwrap(), Some(42));
    assert_eq!(progress.unwrap(), 1.0);
    event_loop.shutdown();
}

#[test]
fn cancel_interrupts_sleeping_computation() {
    let event_loop = EventLoop::spawn("test-affinity").unwrap();
    let ctx: ContextRef = event_loop.clone();
    let (exited_tx, exited) = mpsc::channel();
    let factory_ctx = Arc::clone(&ctx);
    let service: Service<()> = Service::new(ctx, move || {
        let exited_tx = exited_tx.clone();
        Task::new(Arc::clone(&factory_ctx), move |task| {
            let outcome = task.sleep(Duration::from_secs(30));
            let _ = exited_tx.send(outcome.is_err());
            outcome?;
            Ok(())
        })
    });

    let (tx, events) = mpsc::channel();
    let handle = service.clone();
    let executor = pool(1);
    event_loop
        .invoke(move || -> Result<(), WorkerError> {
            handle.set_executor(executor)?;
            handle.add_event_handler(move |event| {
                let _ = tx.send(event.clone());
            })?;
            handle.start()
        })
        .unwrap()
        .unwrap();
    wait_for(&events, WorkerState::Running);

    let handle = service.clone();
    let accepted = event_loop.invoke(move || handle.cancel()).unwrap().unwrap();
    assert!(accepted);
    wait_for(&events, WorkerState::Cancelled);

    let interrupted = exited.recv_timeout(WAIT).expect("computation kept sleeping");
    assert!(interrupted);
    event_loop.shutdown();
}

#[test]
fn scheduled_service_repeats_with_runtime_timer() {
    let event_loop = EventLoop::spawn("test-affinity").unwrap();
    let ctx: ContextRef = event_loop.clone();
    let executor = pool(2);
    let timer = Arc::new(RuntimeTimer::new(executor.handle().clone()));

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let factory_ctx = Arc::clone(&ctx);
    let config = ScheduleConfig {
        period: Interval::from_millis(20),
        ..ScheduleConfig::default()
    };
    let service = ScheduledService::with_config(ctx, timer, config, move || {
        let counter = Arc::clone(&counter);
        Task::new(Arc::clone(&factory_ctx), move |_| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
        })
    });

    let (tx, events) = mpsc::channel();
    let handle = service.clone();
    event_loop
        .invoke(move || -> Result<(), WorkerError> {
            handle.set_executor(executor)?;
            handle.add_event_handler(move |event| {
                let _ = tx.send(event.clone());
            })?;
            handle.start()
        })
        .unwrap()
        .unwrap();

    for _ in 0..3 {
        wait_for(&events, WorkerState::Succeeded);
    }

    let handle = service.clone();
    event_loop.invoke(move || handle.cancel()).unwrap().unwrap();
    wait_for(&events, WorkerState::Cancelled);

    let handle = service.clone();
    let last = event_loop
        .invoke(move || handle.last_value())
        .unwrap()
        .unwrap();
    assert!(last.unwrap() >= 3);
    event_loop.shutdown();
}
