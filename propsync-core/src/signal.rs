//! Callback lists for change and message notifications.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered list of subscriber callbacks.
pub struct Signal<T: ?Sized> {
    slots: Mutex<Vec<(u64, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized + 'static> Signal<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Appends a callback. It stays connected until the returned
    /// subscription is explicitly disconnected.
    pub fn connect<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, Arc::new(callback)));
        let list: Weak<dyn SlotList> = Arc::downgrade(self) as Weak<dyn SlotList>;
        Subscription { list, id }
    }

    /// Invokes every callback in connection order.
    ///
    /// Callbacks run without the list locked, so they may subscribe or
    /// disconnect.
    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = self.slots.lock().iter().map(|(_, s)| s.clone()).collect();
        for slot in slots {
            slot(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

trait SlotList: Send + Sync {
    fn remove(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<T: ?Sized + 'static> SlotList for Signal<T> {
    fn remove(&self, id: u64) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        slots.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.slots.lock().iter().any(|(slot_id, _)| *slot_id == id)
    }
}

/// Handle to a connected callback.
#[derive(Clone)]
pub struct Subscription {
    list: Weak<dyn SlotList>,
    id: u64,
}

impl Subscription {
    /// Removes the callback. Returns false if it was already gone.
    pub fn disconnect(&self) -> bool {
        self.list.upgrade().map_or(false, |list| list.remove(self.id))
    }

    pub fn is_connected(&self) -> bool {
        self.list.upgrade().map_or(false, |list| list.contains(self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_emit_in_order() {
        let signal = Signal::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        signal.connect(move |v| a.lock().push(("a", *v)));
        let b = seen.clone();
        signal.connect(move |v| b.lock().push(("b", *v)));

        signal.emit(&3);
        assert_eq!(*seen.lock(), vec![("a", 3), ("b", 3)]);
    }

    #[test]
    fn test_disconnect() {
        let signal = Signal::<i32>::new();
        let total = Arc::new(AtomicI32::new(0));

        let t = total.clone();
        let sub = signal.connect(move |v| {
            t.fetch_add(*v, Ordering::SeqCst);
        });
        assert!(sub.is_connected());
        signal.emit(&2);

        assert!(sub.disconnect());
        assert!(!sub.disconnect());
        assert!(!sub.is_connected());
        assert!(signal.is_empty());

        signal.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_disconnect_itself() {
        let signal = Signal::<str>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let inner = slot.clone();
        let sub = signal.connect(move |_msg| {
            if let Some(sub) = inner.lock().take() {
                sub.disconnect();
            }
        });
        *slot.lock() = Some(sub);

        signal.emit("first");
        assert!(signal.is_empty());
    }

    #[test]
    fn test_subscription_outlives_signal() {
        let signal = Signal::<i32>::new();
        let sub = signal.connect(|_| {});
        drop(signal);
        assert!(!sub.is_connected());
        assert!(!sub.disconnect());
    }
}
