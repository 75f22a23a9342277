//! Background lease expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::kv::KvStore;

/// Periodically revoke expired leases and delete their keys until
/// `shutdown` flips.
pub async fn run_lease_reaper(
    store: Arc<dyn KvStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, "lease reaper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match store.expire_leases() {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "leases expired"),
                    Err(e) => warn!(error = %e, "lease expiry failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("lease reaper shutting down");
                break;
            }
        }
    }
}
