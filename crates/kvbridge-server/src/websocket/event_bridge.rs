//! Forwards bridge events to WebSocket consumers.
//!
//! `ValueChanged` is serialized once and fanned out through the registry.
//! `Connected` triggers an upstream interest reconciliation.

use std::sync::Arc;

use kvbridge_ipc::BridgeEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol;
use crate::interest::InterestManager;
use crate::registry::SubscriberRegistry;

/// Bridge event consumer feeding the registry.
pub struct EventBridge {
    registry: Arc<SubscriberRegistry>,
    interest: Arc<InterestManager>,
}

impl EventBridge {
    /// Create a forwarder.
    pub fn new(registry: Arc<SubscriberRegistry>, interest: Arc<InterestManager>) -> Self {
        Self { registry, interest }
    }

    /// Handle one event. Returns the fanout count for value changes.
    pub fn handle(&self, event: BridgeEvent) -> usize {
        match event {
            BridgeEvent::ValueChanged { key, value } => {
                let frame = protocol::notification(&value);
                let Ok(json) = serde_json::to_string(&frame) else {
                    warn!(key, "failed to serialize notification");
                    return 0;
                };
                let delivered = self.registry.fanout(&key, Arc::new(json));
                debug!(key, version = value.version, delivered, "value fanned out");
                delivered
            }
            BridgeEvent::Connected => {
                let interest = self.interest.clone();
                let _ = tokio::spawn(async move { interest.reconcile_all().await });
                0
            }
            other => {
                debug!(event = other.name(), "bridge event");
                0
            }
        }
    }

    /// Consume `rx` until it closes or `shutdown` fires.
    pub fn start(
        self,
        mut rx: broadcast::Receiver<BridgeEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let _ = self.handle(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("bridge event channel closed");
                        break;
                    }
                }
            }
        })
    }
}
