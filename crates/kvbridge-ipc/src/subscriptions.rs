//! Local key -> callback map held by the bridge.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kvbridge_core::VersionedValue;
use parking_lot::Mutex;
use tracing::error;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A subscription callback with a stable identity.
///
/// Clones share the identity, so registering a clone of a listener that is
/// already subscribed to a key is a no-op.
#[derive(Clone)]
pub struct Listener {
    id: u64,
    callback: Arc<dyn Fn(&VersionedValue) + Send + Sync>,
}

impl Listener {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&VersionedValue) + Send + Sync + 'static,
    {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    /// Identity shared by all clones.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the callback, containing any panic. Returns `false` on panic.
    pub fn invoke(&self, value: &VersionedValue) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(value)));
        if outcome.is_err() {
            error!(key = %value.key, listener = self.id, "subscription callback panicked");
        }
        outcome.is_ok()
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

/// Key -> listeners, in registration order.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_key: Mutex<HashMap<String, Vec<Listener>>>,
}

impl SubscriptionTable {
    /// Add `listener` to each key; duplicates are ignored.
    pub(crate) fn add(&self, keys: &[String], listener: &Listener) {
        let mut by_key = self.by_key.lock();
        for key in keys {
            let listeners = by_key.entry(key.clone()).or_default();
            if !listeners.contains(listener) {
                listeners.push(listener.clone());
            }
        }
    }

    /// Remove `listener` (or every listener) from each key.
    ///
    /// Returns the keys left without listeners; keys that were never
    /// subscribed count as empty too.
    pub(crate) fn remove(&self, keys: &[String], listener: Option<&Listener>) -> Vec<String> {
        let mut by_key = self.by_key.lock();
        let mut emptied = Vec::new();
        for key in keys {
            let now_empty = match (by_key.get_mut(key), listener) {
                (Some(listeners), Some(listener)) => {
                    listeners.retain(|l| l != listener);
                    listeners.is_empty()
                }
                (Some(listeners), None) => {
                    listeners.clear();
                    true
                }
                (None, _) => true,
            };
            if now_empty {
                let _ = by_key.remove(key);
                if !emptied.contains(key) {
                    emptied.push(key.clone());
                }
            }
        }
        emptied
    }

    /// Snapshot of listeners for `key`.
    pub(crate) fn listeners_for(&self, key: &str) -> Vec<Listener> {
        self.by_key.lock().get(key).cloned().unwrap_or_default()
    }

    /// Keys with at least one listener, sorted.
    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.lock().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub(crate) fn clear(&self) {
        self.by_key.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbridge_core::value::normalize_timestamp;
    use serde_json::json;

    fn value(key: &str) -> VersionedValue {
        VersionedValue {
            key: key.into(),
            value: json!(1),
            version: 1,
            timestamp: normalize_timestamp(&json!(0)).unwrap(),
        }
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| (*k).to_string()).collect()
    }

    #[test]
    fn duplicate_registration_is_noop() {
        let table = SubscriptionTable::default();
        let l = Listener::new(|_| {});
        table.add(&keys(&["a"]), &l);
        table.add(&keys(&["a"]), &l.clone());
        assert_eq!(table.listeners_for("a").len(), 1);
    }

    #[test]
    fn removing_one_of_two_keeps_key() {
        let table = SubscriptionTable::default();
        let (a, b) = (Listener::new(|_| {}), Listener::new(|_| {}));
        table.add(&keys(&["k"]), &a);
        table.add(&keys(&["k"]), &b);
        assert!(table.remove(&keys(&["k"]), Some(&a)).is_empty());
        assert_eq!(table.listeners_for("k"), vec![b.clone()]);
        assert_eq!(table.remove(&keys(&["k"]), Some(&b)), keys(&["k"]));
        assert!(table.keys().is_empty());
    }

    #[test]
    fn remove_all_listeners() {
        let table = SubscriptionTable::default();
        table.add(&keys(&["k", "j"]), &Listener::new(|_| {}));
        table.add(&keys(&["k"]), &Listener::new(|_| {}));
        assert_eq!(table.remove(&keys(&["k"]), None), keys(&["k"]));
        assert_eq!(table.keys(), keys(&["j"]));
    }

    #[test]
    fn unknown_keys_count_as_empty() {
        let table = SubscriptionTable::default();
        assert_eq!(table.remove(&keys(&["ghost"]), None), keys(&["ghost"]));
    }

    #[test]
    fn invoke_contains_panics() {
        let l = Listener::new(|_| panic!("boom"));
        assert!(!l.invoke(&value("k")));
        let ok = Listener::new(|_| {});
        assert!(ok.invoke(&value("k")));
    }

    #[test]
    fn listener_identity_survives_clone() {
        let l = Listener::new(|_| {});
        assert_eq!(l, l.clone());
        assert_ne!(l, Listener::new(|_| {}));
    }
}
