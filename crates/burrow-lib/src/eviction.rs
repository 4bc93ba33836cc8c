//! Removal of tunnels that have gone without a control connection too long

use burrow_router::TunnelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically evict tunnels idle for at least `ttl`
///
/// A tunnel that was never registered counts as idle since its creation; one
/// whose last control connection closed counts as idle since that close.
pub(crate) async fn run_eviction(
    registry: Arc<TunnelRegistry>,
    ttl: Duration,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let evicted = registry.evict_idle(ttl);
        if evicted.is_empty() {
            debug!(tunnels = registry.len(), "Eviction pass found nothing to remove");
        } else {
            info!(count = evicted.len(), ids = ?evicted, "Evicted idle tunnels");
        }
    }
}
