//! Coalescing hand-off of values from background threads to the affinity
//! thread.
//!
//! Each bridged field has one pending slot. A background publish swaps its
//! value into the slot and, only when the slot was empty, posts a single
//! drain job. The drain takes whatever is in the slot at the time it runs,
//! so a burst of publishes costs one queued job and applies the last value.
//! A publish on the affinity thread applies directly; a drain still queued
//! then finds nothing to apply, and stays the field's only queued drain.

use std::sync::{Arc, Mutex};

use crate::affinity::{ContextRef, lock};

type Apply<T> = Arc<dyn Fn(T) + Send + Sync>;

enum Slot<T> {
    /// No drain queued.
    Empty,
    /// A drain is queued; it applies the value, if any is left.
    Queued(Option<T>),
}

/// Publishes values of one field onto the affinity thread.
pub struct AffinityPropertyBridge<T> {
    ctx: ContextRef,
    pending: Arc<Mutex<Slot<T>>>,
    apply: Apply<T>,
}

impl<T> Clone for AffinityPropertyBridge<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            pending: Arc::clone(&self.pending),
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<T: Send + 'static> AffinityPropertyBridge<T> {
    /// `apply` writes the value into the affinity-owned field. It only ever
    /// runs on the affinity thread.
    pub fn new<F>(ctx: ContextRef, apply: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            ctx,
            pending: Arc::new(Mutex::new(Slot::Empty)),
            apply: Arc::new(apply),
        }
    }

    /// Apply now when on the affinity thread, otherwise coalesce into the
    /// pending slot.
    pub fn publish(&self, value: T) {
        if self.ctx.is_affinity_thread() {
            // Anything still pending is older than this value.
            if let Slot::Queued(pending) = &mut *lock(&self.pending) {
                pending.take();
            }
            (self.apply)(value);
            return;
        }

        let drain_needed = {
            let mut slot = lock(&self.pending);
            match &mut *slot {
                Slot::Queued(pending) => {
                    *pending = Some(value);
                    false
                }
                Slot::Empty => {
                    *slot = Slot::Queued(Some(value));
                    true
                }
            }
        };
        if drain_needed {
            let pending = Arc::clone(&self.pending);
            let apply = Arc::clone(&self.apply);
            self.ctx.run_later(Box::new(move || {
                let latest = match std::mem::replace(&mut *lock(&pending), Slot::Empty) {
                    Slot::Queued(latest) => latest,
                    Slot::Empty => None,
                };
                if let Some(value) = latest {
                    apply(value);
                }
            }));
        }
    }

    /// Whether a published value is waiting for its drain.
    pub fn has_pending(&self) -> bool {
        matches!(&*lock(&self.pending), Slot::Queued(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::affinity::{AffinityContext, ManualContext};

    fn recording_bridge(ctx: &Arc<ManualContext>) -> (AffinityPropertyBridge<String>, Arc<Mutex<Vec<String>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let bridge = AffinityPropertyBridge::new(ctx.clone() as ContextRef, move |v: String| {
            sink.lock().unwrap().push(v);
        });
        (bridge, applied)
    }

    #[test]
    fn burst_from_background_applies_last_value_once() {
        let ctx = ManualContext::new();
        let (bridge, applied) = recording_bridge(&ctx);

        let background = bridge.clone();
        thread::spawn(move || {
            for v in ["a", "b", "c"] {
                background.publish(v.to_string());
            }
        })
        .join()
        .unwrap();

        assert_eq!(ctx.pending(), 1);
        assert!(bridge.has_pending());
        assert_eq!(ctx.run_pending().unwrap(), 1);
        assert_eq!(*applied.lock().unwrap(), vec!["c".to_string()]);
        assert!(!bridge.has_pending());
    }

    #[test]
    fn publish_after_drain_posts_again() {
        let ctx = ManualContext::new();
        let (bridge, applied) = recording_bridge(&ctx);

        let background = bridge.clone();
        thread::spawn(move || background.publish("first".to_string()))
            .join()
            .unwrap();
        ctx.run_pending().unwrap();

        let background = bridge.clone();
        thread::spawn(move || background.publish("second".to_string()))
            .join()
            .unwrap();
        assert_eq!(ctx.pending(), 1);
        ctx.run_pending().unwrap();

        assert_eq!(*applied.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn affinity_thread_applies_immediately() {
        let ctx = ManualContext::new();
        let (bridge, applied) = recording_bridge(&ctx);
        assert!(ctx.is_affinity_thread());

        bridge.publish("now".to_string());
        assert_eq!(ctx.pending(), 0);
        assert_eq!(*applied.lock().unwrap(), vec!["now"]);
    }

    #[test]
    fn direct_apply_supersedes_pending_value() {
        let ctx = ManualContext::new();
        let (bridge, applied) = recording_bridge(&ctx);

        let background = bridge.clone();
        thread::spawn(move || background.publish("stale".to_string()))
            .join()
            .unwrap();
        bridge.publish("fresh".to_string());
        ctx.run_pending().unwrap();

        assert_eq!(*applied.lock().unwrap(), vec!["fresh"]);
    }

    #[test]
    fn direct_apply_keeps_single_queued_drain() {
        let ctx = ManualContext::new();
        let (bridge, applied) = recording_bridge(&ctx);

        let background = bridge.clone();
        thread::spawn(move || background.publish("1".to_string()))
            .join()
            .unwrap();
        bridge.publish("2".to_string());
        assert!(!bridge.has_pending());

        let background = bridge.clone();
        thread::spawn(move || background.publish("3".to_string()))
            .join()
            .unwrap();
        assert_eq!(ctx.pending(), 1);
        assert!(bridge.has_pending());

        assert_eq!(ctx.run_pending().unwrap(), 1);
        assert_eq!(*applied.lock().unwrap(), vec!["2", "3"]);
        assert!(!bridge.has_pending());
    }
}
