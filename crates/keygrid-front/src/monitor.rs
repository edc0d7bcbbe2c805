//! Background probing of the front's backends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::front::LoadBalancerFront;

/// Wake every `interval` and probe the backends that are due, until
/// `shutdown` flips. Backends that keep failing are skipped on some ticks
/// as their probe interval backs off.
pub async fn run_probe_loop(
    front: Arc<LoadBalancerFront>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(front = %front.name(), ?interval, "probe loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let results = front.probe_due().await;
                let healthy = results.iter().filter(|b| b.is_routable()).count();
                debug!(front = %front.name(), backends = results.len(), healthy, "probe pass");
            }
            _ = shutdown.changed() => {
                debug!(front = %front.name(), "probe loop shutting down");
                break;
            }
        }
    }
}
