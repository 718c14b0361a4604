//! Per-state handlers and generic observers of worker state changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::affinity::lock;
use crate::worker::state::{WorkerState, WorkerStateEvent};

/// Callback invoked with a state-change event.
pub type EventHandler = Arc<dyn Fn(&WorkerStateEvent) + Send + Sync>;

/// Identifies an observer registered with `add_event_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    per_state: HashMap<WorkerState, EventHandler>,
    observers: Vec<(HandlerId, EventHandler)>,
    next_id: u64,
}

/// Handler storage shared by tasks and services.
#[derive(Default)]
pub(crate) struct EventHandlers {
    registry: Mutex<Registry>,
}

impl EventHandlers {
    /// Install (or clear, with `None`) the handler for one state.
    pub fn set_on(&self, state: WorkerState, handler: Option<EventHandler>) {
        let mut registry = lock(&self.registry);
        match handler {
            Some(handler) => {
                registry.per_state.insert(state, handler);
            }
            None => {
                registry.per_state.remove(&state);
            }
        }
    }

    pub fn has_handler(&self, state: WorkerState) -> bool {
        lock(&self.registry).per_state.contains_key(&state)
    }

    pub fn add(&self, handler: EventHandler) -> HandlerId {
        let mut registry = lock(&self.registry);
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push((id, handler));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.observers.len();
        registry.observers.retain(|(h, _)| *h != id);
        registry.observers.len() != before
    }

    /// Run the state's own handler, then every observer in registration
    /// order. No lock is held while handlers run.
    pub fn dispatch(&self, event: &WorkerStateEvent) {
        let (own, observers) = {
            let registry = lock(&self.registry);
            let own = registry.per_state.get(&event.state).cloned();
            let observers: Vec<EventHandler> = registry
                .observers
                .iter()
                .map(|(_, h)| Arc::clone(h))
                .collect();
            (own, observers)
        };

        if let Some(handler) = own {
            handler(event);
        }
        for observer in observers {
            observer(event);
        }
    }
}
