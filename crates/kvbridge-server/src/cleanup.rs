//! Periodic removal of inactive consumers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::interest::InterestManager;
use crate::registry::SubscriberRegistry;

/// Every `interval`, drop consumers idle for longer than `threshold` and
/// re-run interest reconciliation. Exits when `shutdown` fires.
pub fn start_cleanup_task(
    registry: Arc<SubscriberRegistry>,
    interest: Arc<InterestManager>,
    interval: Duration,
    threshold: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("cleanup task stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let removed = registry.cleanup_inactive(threshold);
            if removed > 0 {
                info!(removed, "inactive consumer cleanup");
            }
            interest.reconcile_all().await;
        }
    })
}
