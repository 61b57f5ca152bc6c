//! Periodic sweep of expired claims and stale instance presence.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConfHandle;
use crate::ratelimit::RedeemRateLimiter;
use crate::storage::RelayStore;
use crate::task::{ShutdownSignal, Task};

/// Expired claims linger this long so redeem can keep answering `expired`
/// instead of `not_found`.
const CLAIM_SWEEP_GRACE: Duration = Duration::ZERO;

pub struct CleanupTask {
    pub conf_handle: ConfHandle,
    pub store: RelayStore,
    pub redeem_limiter: RedeemRateLimiter,
}

#[async_trait]
impl Task for CleanupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "cleanup";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        cleanup_task(self, shutdown_signal).await;
        Ok(())
    }
}

#[instrument(skip_all)]
async fn cleanup_task(task: CleanupTask, mut shutdown_signal: ShutdownSignal) {
    let conf = task.conf_handle.get_conf();

    debug!("Task started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(conf.cleanup_interval) => {}
            _ = shutdown_signal.wait() => {
                break;
            }
        }

        match task.store.cleanup_claims(CLAIM_SWEEP_GRACE).await {
            Ok(deleted_count) if deleted_count > 0 => {
                info!(deleted_count, "Swept expired claims");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(error = format!("{error:#}"), "Claim sweep failed");
            }
        }

        match task.store.sweep_stale(conf.stale_after).await {
            Ok(offline_count) if offline_count > 0 => {
                info!(offline_count, "Marked stale instances offline");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(error = format!("{error:#}"), "Stale-instance sweep failed");
            }
        }

        task.redeem_limiter.cleanup();
    }

    debug!("Task terminated");
}
