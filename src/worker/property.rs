//! Observable values with change listeners and one-way binding.
//!
//! A [`Property`] owns a value and a list of listeners invoked with
//! `(old, new)` after every change. Setting an equal value is not a change.
//! `bind(source)` makes the property mirror `source` until `unbind()`.
//! Listeners run on the thread that performed the change, with no lock held,
//! so they may freely read or write other properties (or this one).

use std::sync::{Arc, Mutex, Weak};

use crate::affinity::lock;

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Identifies a listener registered with [`Property::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Binding<T> {
    source: Property<T>,
    subscription: Subscription,
}

struct PropertyInner<T> {
    value: T,
    listeners: Vec<(Subscription, Listener<T>)>,
    next_id: u64,
    binding: Option<Binding<T>>,
}

/// An observable, bindable value.
pub struct Property<T> {
    inner: Arc<Mutex<PropertyInner<T>>>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Property<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PropertyInner {
                value,
                listeners: Vec::new(),
                next_id: 0,
                binding: None,
            })),
        }
    }

    pub fn get(&self) -> T {
        lock(&self.inner).value.clone()
    }

    /// Replace the value, notifying listeners if it changed.
    pub fn set(&self, value: T) {
        let (old, listeners) = {
            let mut inner = lock(&self.inner);
            if inner.value == value {
                return;
            }
            let old = std::mem::replace(&mut inner.value, value.clone());
            let listeners: Vec<Listener<T>> =
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (old, listeners)
        };

        for listener in listeners {
            listener(&old, &value);
        }
    }

    /// Register `listener`, called with `(old, new)` after each change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = Subscription(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.listeners.len();
        inner.listeners.retain(|(id, _)| *id != subscription);
        inner.listeners.len() != before
    }

    /// Mirror `source`: take its current value now and every later change,
    /// until [`unbind`](Self::unbind). Replaces any previous binding.
    pub fn bind(&self, source: &Property<T>) {
        self.unbind();

        let target: Weak<Mutex<PropertyInner<T>>> = Arc::downgrade(&self.inner);
        let subscription = source.subscribe(move |_, new| {
            if let Some(inner) = target.upgrade() {
                Property { inner }.set(new.clone());
            }
        });

        lock(&self.inner).binding = Some(Binding {
            source: source.clone(),
            subscription,
        });
        self.set(source.get());
    }

    /// Stop mirroring the bound source. The current value is kept.
    pub fn unbind(&self) {
        let binding = lock(&self.inner).binding.take();
        if let Some(binding) = binding {
            binding.source.unsubscribe(binding.subscription);
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.inner).binding.is_some()
    }

    /// A view exposing only reads and subscriptions.
    pub fn read_only(&self) -> ReadOnlyProperty<T> {
        ReadOnlyProperty {
            property: self.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Property<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Property")
            .field("value", &inner.value)
            .field("listeners", &inner.listeners.len())
            .field("bound", &inner.binding.is_some())
            .finish()
    }
}

/// Read access to a [`Property`] owned by someone else.
#[derive(Clone)]
pub struct ReadOnlyProperty<T> {
    property: Property<T>,
}

impl<T> ReadOnlyProperty<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn get(&self) -> T {
        self.property.get()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.property.subscribe(listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.property.unsubscribe(subscription)
    }
}
