//! Notification multiplexer.
//!
//! Unsolicited frames from the datastore fan out to every registered
//! listener, in the order the transport received them. The correlator is
//! never involved.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kvbridge_core::metrics::IPC_NOTIFICATIONS_TOTAL;
use kvbridge_core::wire::Notification;
use metrics::counter;
use parking_lot::RwLock;
use tracing::error;

/// Callback receiving raw notifications.
pub type NotificationListener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned by [`NotificationHub::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Routes notifications to all listeners.
#[derive(Default)]
pub struct NotificationHub {
    next_handle: AtomicU64,
    listeners: RwLock<Vec<(ListenerHandle, NotificationListener)>>,
}

impl NotificationHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: NotificationListener) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((handle, listener));
        handle
    }

    /// Remove a listener; `false` if it was not registered.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver to every listener; returns how many ran without panicking.
    ///
    /// Listeners run outside the lock, so they may add or remove listeners.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        counter!(IPC_NOTIFICATIONS_TOTAL).increment(1);
        let snapshot: Vec<NotificationListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        let mut delivered = 0;
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(notification))).is_ok() {
                delivered += 1;
            } else {
                error!(key = %notification.key, "notification listener panicked");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn note(key: &str, version: u64) -> Notification {
        Notification {
            key: key.into(),
            value: json!(version),
            version,
            timestamp: json!(0),
        }
    }

    #[test]
    fn every_listener_receives() {
        let hub = NotificationHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            let _ = hub.add_listener(Arc::new(move |n: &Notification| {
                seen.lock().push(format!("{tag}:{}", n.key));
            }));
        }
        assert_eq!(hub.dispatch(&note("x", 1)), 2);
        assert_eq!(*seen.lock(), vec!["a:x", "b:x"]);
    }

    #[test]
    fn order_follows_dispatch_order() {
        let hub = NotificationHub::new();
        let versions = Arc::new(Mutex::new(Vec::new()));
        let sink = versions.clone();
        let _ = hub.add_listener(Arc::new(move |n: &Notification| sink.lock().push(n.version)));
        for v in 1..=5 {
            let _ = hub.dispatch(&note("x", v));
        }
        assert_eq!(*versions.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let hub = NotificationHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let handle = hub.add_listener(Arc::new(move |_: &Notification| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        }));
        let _ = hub.dispatch(&note("x", 1));
        assert!(hub.remove_listener(handle));
        assert!(!hub.remove_listener(handle));
        let _ = hub.dispatch(&note("x", 2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let hub = NotificationHub::new();
        let _ = hub.add_listener(Arc::new(|_: &Notification| panic!("listener bug")));
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let _ = hub.add_listener(Arc::new(move |_: &Notification| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hub.dispatch(&note("x", 1)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
