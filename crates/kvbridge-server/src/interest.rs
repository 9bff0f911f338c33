//! Keeps the bridge's upstream subscriptions equal to the set of keys that
//! have at least one registry subscriber.

use std::collections::HashSet;
use std::sync::Arc;

use kvbridge_ipc::{DatastoreBridge, Listener};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::registry::SubscriberRegistry;

#[derive(Default)]
struct Upstream {
    /// Keys acknowledged upstream.
    held: HashSet<String>,
    /// Keys with an upstream call in progress.
    in_flight: HashSet<String>,
}

/// Serializes upstream subscribe/unsubscribe decisions.
pub struct InterestManager {
    bridge: DatastoreBridge,
    registry: Arc<SubscriberRegistry>,
    upstream: Mutex<Upstream>,
    order: tokio::sync::Mutex<()>,
    listener: Listener,
}

impl InterestManager {
    /// Create a manager with no upstream interest.
    pub fn new(bridge: DatastoreBridge, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            bridge,
            registry,
            upstream: Mutex::new(Upstream::default()),
            order: tokio::sync::Mutex::new(()),
            listener: Listener::new(|value| {
                trace!(key = %value.key, version = value.version, "upstream value");
            }),
        }
    }

    /// Keys to subscribe and unsubscribe upstream. Call with `upstream` held.
    fn diff(&self, upstream: &Upstream, keys: &[String]) -> (Vec<String>, Vec<String>) {
        let mut to_add = Vec::new();
        let mut to_remove = Vec::new();
        for key in keys {
            let wanted = self.registry.subscriber_count(key) > 0;
            let held = upstream.held.contains(key);
            if wanted && !held && !to_add.contains(key) {
                to_add.push(key.clone());
            } else if !wanted && held && !to_remove.contains(key) {
                to_remove.push(key.clone());
            }
        }
        (to_add, to_remove)
    }

    /// Bring upstream interest for `keys` in line with the registry.
    ///
    /// Upstream calls are serialized. A call that finds nothing to change
    /// for `keys`, and none of them in flight, returns without waiting, so
    /// a stalled datastore only delays callers that need an upstream change
    /// (each by up to the bridge's request timeout per queued call).
    ///
    /// Failed upstream calls leave the key in its previous state; a later
    /// call heals it.
    pub async fn reconcile(&self, keys: &[String]) {
        {
            let upstream = self.upstream.lock();
            let (to_add, to_remove) = self.diff(&upstream, keys);
            if to_add.is_empty()
                && to_remove.is_empty()
                && !keys.iter().any(|k| upstream.in_flight.contains(k))
            {
                return;
            }
        }

        let _order = self.order.lock().await;
        let (to_add, to_remove) = {
            let mut upstream = self.upstream.lock();
            let (to_add, to_remove) = self.diff(&upstream, keys);
            upstream.in_flight.extend(to_add.iter().cloned());
            upstream.in_flight.extend(to_remove.iter().cloned());
            (to_add, to_remove)
        };

        if !to_add.is_empty() {
            let result = self.bridge.subscribe(&to_add, &self.listener).await;
            let mut upstream = self.upstream.lock();
            for key in &to_add {
                let _ = upstream.in_flight.remove(key);
            }
            match result {
                Ok(()) => {
                    debug!(keys = ?to_add, "upstream subscribe");
                    upstream.held.extend(to_add);
                }
                Err(err) => warn!(keys = ?to_add, error = %err, "upstream subscribe failed"),
            }
        }

        if !to_remove.is_empty() {
            let result = self.bridge.unsubscribe(&to_remove, Some(&self.listener)).await;
            let mut upstream = self.upstream.lock();
            for key in &to_remove {
                let _ = upstream.in_flight.remove(key);
            }
            match result {
                Ok(()) => {
                    debug!(keys = ?to_remove, "upstream unsubscribe");
                    for key in &to_remove {
                        let _ = upstream.held.remove(key);
                    }
                }
                Err(err) => warn!(keys = ?to_remove, error = %err, "upstream unsubscribe failed"),
            }
        }
    }

    /// Reconcile every key the registry or upstream knows about.
    pub async fn reconcile_all(&self) {
        let mut keys: HashSet<String> = self.upstream.lock().held.iter().cloned().collect();
        keys.extend(self.registry.subscribed_keys());
        let keys: Vec<String> = keys.into_iter().collect();
        self.reconcile(&keys).await;
    }

    /// Keys currently subscribed upstream, sorted.
    pub fn upstream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.upstream.lock().held.iter().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Forget upstream interest, e.g. after the bridge was disconnected.
    pub fn clear(&self) {
        self.upstream.lock().held.clear();
    }
}
