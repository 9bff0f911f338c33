//! Subscriber registry.
//!
//! Tracks remote consumers and their key subscriptions through a
//! bidirectional index (consumer -> keys, key -> consumers) kept under a
//! single lock, so an edge exists in both directions or in neither. Fanout
//! snapshots the recipients under the lock and sends outside it; a consumer
//! that cannot take a frame is removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kvbridge_core::ConsumerId;
use kvbridge_core::metrics::{REGISTRY_CONSUMERS_EVICTED_TOTAL, REGISTRY_FANOUT_DELIVERIES_TOTAL};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::websocket::connection::ConsumerConnection;

/// Registry counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Registered consumers.
    pub consumer_count: usize,
    /// (consumer, key) pairs.
    pub total_subscription_edges: usize,
    /// Keys with at least one subscriber.
    pub distinct_subscribed_keys: usize,
}

struct ConsumerRecord {
    handle: Arc<ConsumerConnection>,
    keys: HashSet<String>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

#[derive(Default)]
struct State {
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    by_key: HashMap<String, HashSet<ConsumerId>>,
}

impl State {
    fn unlink(&mut self, id: &ConsumerId, key: &str) {
        if let Some(set) = self.by_key.get_mut(key) {
            let _ = set.remove(id);
            if set.is_empty() {
                let _ = self.by_key.remove(key);
            }
        }
    }
}

/// Consumers and their subscriptions.
#[derive(Default)]
pub struct SubscriberRegistry {
    state: Mutex<State>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer with no subscriptions.
    pub fn add_consumer(&self, handle: Arc<ConsumerConnection>) -> ConsumerId {
        let id = ConsumerId::new();
        let record = ConsumerRecord {
            handle,
            keys: HashSet::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
        };
        let _ = self.state.lock().consumers.insert(id.clone(), record);
        debug!(consumer_id = %id, "consumer registered");
        id
    }

    /// Add the edge (`id`, `key`). `false` when the consumer is unknown.
    pub fn subscribe(&self, id: &ConsumerId, key: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.consumers.get_mut(id) else {
            return false;
        };
        let _ = record.keys.insert(key.to_string());
        let _ = state
            .by_key
            .entry(key.to_string())
            .or_default()
            .insert(id.clone());
        true
    }

    /// Remove the edge (`id`, `key`). `false` when the consumer is unknown.
    pub fn unsubscribe(&self, id: &ConsumerId, key: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.consumers.get_mut(id) else {
            return false;
        };
        let _ = record.keys.remove(key);
        state.unlink(id, key);
        true
    }

    /// Drop a consumer and every edge it held, and close its socket.
    ///
    /// Returns the keys it was subscribed to; empty for an unknown id.
    pub fn remove_consumer(&self, id: &ConsumerId) -> Vec<String> {
        let record = {
            let mut state = self.state.lock();
            let Some(record) = state.consumers.remove(id) else {
                return Vec::new();
            };
            for key in &record.keys {
                state.unlink(id, key);
            }
            record
        };
        record.handle.close();
        debug!(
            consumer_id = %id,
            keys = record.keys.len(),
            connected_for_ms = (Utc::now() - record.created_at).num_milliseconds(),
            "consumer removed"
        );
        record.keys.into_iter().collect()
    }

    /// Deliver `payload` to every subscriber of `key`.
    ///
    /// Consumers that cannot take the frame are removed and not counted.
    pub fn fanout(&self, key: &str, payload: Arc<String>) -> usize {
        let targets: Vec<(ConsumerId, Arc<ConsumerConnection>)> = {
            let state = self.state.lock();
            let Some(ids) = state.by_key.get(key) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| {
                    state
                        .consumers
                        .get(id)
                        .map(|record| (id.clone(), record.handle.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, handle) in targets {
            match handle.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    warn!(consumer_id = %id, key, reason = reason.as_str(), "delivery failed, evicting consumer");
                    failed.push(id);
                }
            }
        }

        for id in &failed {
            let _ = self.remove_consumer(id);
        }
        if !failed.is_empty() {
            counter!(REGISTRY_CONSUMERS_EVICTED_TOTAL, "reason" => "delivery").increment(failed.len() as u64);
        }
        counter!(REGISTRY_FANOUT_DELIVERIES_TOTAL).increment(delivered as u64);
        delivered
    }

    /// Record activity for `id`. `false` when unknown.
    pub fn touch(&self, id: &ConsumerId) -> bool {
        match self.state.lock().consumers.get_mut(id) {
            Some(record) => {
                record.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove consumers idle longer than `threshold`. Returns how many.
    pub fn cleanup_inactive(&self, threshold: Duration) -> usize {
        let stale: Vec<ConsumerId> = {
            let state = self.state.lock();
            state
                .consumers
                .iter()
                .filter(|(_, record)| record.last_activity.elapsed() > threshold)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            let _ = self.remove_consumer(id);
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), threshold_secs = threshold.as_secs(), "removed inactive consumers");
            counter!(REGISTRY_CONSUMERS_EVICTED_TOTAL, "reason" => "inactive").increment(stale.len() as u64);
        }
        stale.len()
    }

    /// Remove every consumer and close its socket. Returns how many.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<ConsumerId> = self.state.lock().consumers.keys().cloned().collect();
        for id in &ids {
            let _ = self.remove_consumer(id);
        }
        ids.len()
    }

    /// Snapshot of the registry counters.
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            consumer_count: state.consumers.len(),
            total_subscription_edges: state.consumers.values().map(|r| r.keys.len()).sum(),
            distinct_subscribed_keys: state.by_key.len(),
        }
    }

    /// Subscribers of `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.state.lock().by_key.get(key).map_or(0, HashSet::len)
    }

    /// Keys with at least one subscriber.
    pub fn subscribed_keys(&self) -> Vec<String> {
        self.state.lock().by_key.keys().cloned().collect()
    }

    /// Keys held by `id`, sorted.
    pub fn keys_of(&self, id: &ConsumerId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .lock()
            .consumers
            .get(id)
            .map(|r| r.keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConsumerId) -> bool {
        self.state.lock().consumers.contains_key(id)
    }

    /// Registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }
}
