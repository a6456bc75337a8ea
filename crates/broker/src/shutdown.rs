//! Process shutdown coordination.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

/// Run a teardown future under a grace period.
///
/// The teardown is expected to stop intake first (cancel subscription,
/// stop the poller), let in-flight work settle, then release broker
/// resources. Returns `true` when it finished in time; `false` means
/// the grace period elapsed and the owning process should force-exit.
pub async fn shutdown_with_grace<F>(grace: Duration, teardown: F) -> bool
where
    F: Future<Output = ()>,
{
    match tokio::time::timeout(grace, teardown).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            true
        }
        Err(_) => {
            error!(grace_ms = grace.as_millis() as u64, "graceful shutdown timed out");
            false
        }
    }
}
