//! In-process event fan-out with explicit unsubscribe handles.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<E>>,
}

/// A set of handlers that all see every published event, in subscription order.
pub struct EventBus<E> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    /// Register `handler`; it stays registered until the returned handle is released.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut inner) => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.handlers.insert(id, Arc::new(handler));
                id
            }
            Err(_) => return Subscription::inert(),
        };

        let weak: Weak<Mutex<BusInner<E>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Ok(mut inner) = inner.lock() {
                inner.handlers.remove(&id);
            }
        })
    }

    pub fn publish(&self, event: &E) {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<Handler<E>> = match self.inner.lock() {
            Ok(inner) => inner.handlers.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.handlers.len())
            .unwrap_or(0)
    }
}

/// Registration handle. Dropping it unregisters the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
