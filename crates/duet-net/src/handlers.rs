//! Per-client observer registries.
//!
//! Observers are called in registration order. A panicking observer is
//! logged and skipped; the remaining observers still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ObserverList<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

pub struct Observers<T> {
    name: &'static str,
    inner: Arc<Mutex<ObserverList<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(ObserverList {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObserverList<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Handler<T> = Arc::new(handler);
        let id = {
            let mut list = self.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.handlers.push((id, handler));
            id
        };

        let registry: Weak<Mutex<ObserverList<T>>> = Arc::downgrade(&self.inner);
        Unsubscribe {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    let mut list = registry.lock().unwrap_or_else(|e| e.into_inner());
                    list.handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every observer. Returns the number of observers
    /// that panicked.
    pub fn dispatch(&self, event: &T) -> usize {
        // Snapshot so observers may (un)register without deadlocking.
        let handlers: Vec<Handler<T>> = self.lock().handlers.iter().map(|(_, h)| h.clone()).collect();

        let mut failures = 0;
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                failures += 1;
                error!(observers = self.name, "Observer panicked while handling event");
            }
        }
        failures
    }

    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned when registering an observer.
///
/// Dropping it leaves the observer registered; call [`Unsubscribe::unsubscribe`]
/// to remove it.
#[must_use = "keep the disposer to be able to unregister the observer"]
pub struct Unsubscribe {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
