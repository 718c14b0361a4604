//! Worker state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created (or reset) and not yet scheduled.
    Ready,
    /// Handed to an executor, not yet running.
    Scheduled,
    /// Computation in progress on a background thread.
    Running,
    /// Computation returned a value.
    Succeeded,
    /// Computation returned an error or panicked.
    Failed,
    /// Cancelled before completing.
    Cancelled,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Terminal states only lead back to `Ready`, which is reachable for
    /// reusable workers (services) alone.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Ready
            (Ready, Scheduled) | (Ready, Cancelled) |
            // From Scheduled
            (Scheduled, Running) | (Scheduled, Cancelled) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) |
            // Reuse
            (Succeeded, Ready) | (Failed, Ready) | (Cancelled, Ready)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the `running` flag is set in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Dispatched to observers after a worker enters a new state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStateEvent {
    /// Worker that changed state.
    pub worker_id: Uuid,
    /// State entered.
    pub state: WorkerState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
}

impl WorkerStateEvent {
    pub fn new(worker_id: Uuid, state: WorkerState) -> Self {
        Self {
            worker_id,
            state,
            timestamp: Utc::now(),
        }
    }
}
