//! Typed publish/subscribe plumbing. A subscription is a handle that
//! unregisters itself deterministically on drop, and a `Signal` is a
//! one-shot event that stays set once fired.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

struct Slot<T> {
    id: u64,
    tx: UnboundedSender<T>,
}

struct HubInner<T> {
    subscribers: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

/// Broadcast hub. Publishing clones the event into every live
/// subscription's queue; closed subscriptions are pruned as they appear.
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Hub handles share the subscriber list.
impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().push(Slot { id, tx });
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone> EventHub<T> {
    pub fn publish(&self, event: T) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|slot| slot.tx.send(event.clone()).is_ok());
    }
}

/// Receiving end of one subscription. Dropping it removes the slot from
/// the hub.
pub struct Subscription<T> {
    id: u64,
    rx: UnboundedReceiver<T>,
    hub: Weak<HubInner<T>>,
}

impl<T> Subscription<T> {
    /// Waits for the next event; `None` once the hub is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers
                .lock()
                .unwrap()
                .retain(|slot| slot.id != self.id);
        }
    }
}

/// One-shot event: `fire` is sticky, every past and future waiter returns.
#[derive(Debug, Default)]
pub struct Signal {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                break;
            }
            notified.await;
        }
    }
}
