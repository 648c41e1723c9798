use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use junction_router::BusController;

/// Sweep found advertised names whose TTL ran out.
pub async fn expiry_loop(bus: Arc<BusController>, every: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = bus.expire_names();
        if expired > 0 {
            tracing::debug!(expired, "expired found names");
        }
    }
}
