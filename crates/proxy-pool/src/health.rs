//! Periodic background proxy health checks
//!
//! Spawns a task that probes every endpoint on a fixed interval so that dead
//! proxies are already marked unhealthy before a request would pick them. The
//! task runs independently of the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::ProxyPool;

/// Spawn a background task that checks every endpoint each `interval`.
///
/// The first check runs one interval after spawning. The task exits when
/// `shutdown` is cancelled. Returns the task's `JoinHandle`.
pub fn spawn_health_task(
    pool: Arc<ProxyPool>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if pool.is_empty().await {
            debug!("no proxy endpoints configured, health task idle");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("proxy health task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let healthy = pool.check_all().await;
                    debug!(healthy, "background proxy health cycle done");
                }
            }
        }
    })
}
