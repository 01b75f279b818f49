use crate::restore::RestoreService;
use crate::schemas::v1::db::queries as db;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Unmounts restore mounts whose idle TTL has elapsed. Unmount already
/// escalates to a lazy unmount, so a misbehaving filesystem cannot wedge
/// the eviction loop.
pub async fn run_eviction(service: Arc<RestoreService>) {
    loop {
        tokio::time::sleep(SCAN_INTERVAL).await;

        let expired = match db::mount::expired_mounts(service.pool()).await {
            Ok(mounts) => mounts,
            Err(e) => {
                error!("Eviction scan failed: {}", e);
                continue;
            }
        };

        for mount in expired {
            info!(
                "Restore mount {} expired at {}; evicting",
                mount.mount_uuid, mount.expires_at
            );
            if let Err(e) = service.unmount(&mount.mount_uuid).await {
                error!("Eviction of mount {} failed: {}", mount.mount_uuid, e);
            }
        }
    }
}
