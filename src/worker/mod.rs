//! Workers: tasks, services and scheduled services.
//!
//! Core components:
//! - `state`: lifecycle states and state-change events
//! - `property`: observable, bindable fields
//! - `bridge`: coalesced publishing from background threads
//! - `task`: one-shot background computation
//! - `service`: reusable controller creating a task per run
//! - `scheduled`: service re-running on a period with failure backoff
//! - `backoff`: schedule intervals and backoff strategies

pub mod backoff;
pub mod bridge;
pub mod event;
pub mod property;
pub mod scheduled;
pub mod service;
pub mod state;
pub mod task;
pub mod worker;

pub use backoff::{BackoffStrategy, Interval};
pub use bridge::AffinityPropertyBridge;
pub use event::{EventHandler, HandlerId};
pub use property::{Property, ReadOnlyProperty, Subscription};
pub use scheduled::ScheduledService;
pub use service::{Service, TaskFactory};
pub use state::{WorkerState, WorkerStateEvent};
pub use task::{Task, TaskContext};
pub use worker::{Failure, Worker, WorkerProperties};
