use std::sync::Arc;
use std::time::Duration;

use affinity_workers::affinity::{ContextRef, EventLoop};
use affinity_workers::config::ScheduleConfig;
use affinity_workers::executor::default_pool;
use affinity_workers::timer::{RuntimeTimer, Timer};
use affinity_workers::worker::{Interval, ScheduledService, Task, WorkerState, WorkerStateEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let iterations: u32 = std::env::var("AFFINITY_WORKERS_ITERATIONS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .unwrap_or(3);

    let period_ms: u64 = std::env::var("AFFINITY_WORKERS_PERIOD_MS")
        .unwrap_or_else(|_| "250".to_string())
        .parse()
        .unwrap_or(250);

    eprintln!("Affinity workers v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Iterations: {}", iterations);
    eprintln!("   Period: {}ms\n", period_ms);

    let event_loop = EventLoop::spawn("affinity-loop")?;
    let ctx: ContextRef = event_loop.clone();

    let pool = default_pool()?;
    let timer: Arc<dyn Timer> = Arc::new(RuntimeTimer::new(pool.handle().clone()));

    let config = ScheduleConfig {
        delay: Interval::from_millis(100),
        period: Interval::from_millis(period_ms),
        maximum_failure_count: 5,
        ..ScheduleConfig::default()
    };

    let factory_ctx = Arc::clone(&ctx);
    let service = ScheduledService::with_config(ctx, timer, config, move || {
        Task::new(Arc::clone(&factory_ctx), |task| {
            task.update_title("sampling");
            for step in 1..=10u32 {
                task.sleep(Duration::from_millis(20))?;
                task.update_progress(f64::from(step), 10.0);
                task.update_message(format!("step {step}/10"));
            }
            Ok(chrono::Utc::now())
        })
    });

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerStateEvent>();
    let handle = service.clone();
    on_loop(&event_loop, move || {
        handle.add_event_handler(move |event| {
            let _ = events_tx.send(event.clone());
        })?;
        handle.start()
    })
    .await??;

    let mut succeeded = 0;
    while let Some(event) = events_rx.recv().await {
        tracing::info!(event = %serde_json::to_string(&event)?, "Service event");
        match event.state {
            WorkerState::Succeeded => {
                succeeded += 1;
                if succeeded >= iterations {
                    break;
                }
            }
            WorkerState::Failed | WorkerState::Cancelled => break,
            _ => {}
        }
    }

    let handle = service.clone();
    let (last_value, failures) = on_loop(&event_loop, move || {
        handle.cancel()?;
        Ok::<_, affinity_workers::error::WorkerError>((
            handle.last_value()?,
            handle.current_failure_count()?,
        ))
    })
    .await??;

    eprintln!("\nCompleted {} iterations", succeeded);
    if let Some(at) = last_value {
        eprintln!("   Last value: {}", at.to_rfc3339());
    }
    eprintln!("   Failures: {}", failures);

    let closing = Arc::clone(&event_loop);
    tokio::task::spawn_blocking(move || closing.shutdown()).await?;
    Ok(())
}

/// Run `f` on the event loop without blocking the async runtime.
async fn on_loop<R, F>(event_loop: &Arc<EventLoop>, f: F) -> Result<R, BoxError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let event_loop = Arc::clone(event_loop);
    Ok(tokio::task::spawn_blocking(move || event_loop.invoke(f)).await??)
}
