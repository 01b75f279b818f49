use crate::orchestrator::BackupOrchestrator;
use crate::schemas::v1::db::queries as db;
use chrono::{Duration as ChronoDuration, Utc};
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Fails and cleans up jobs that have been `running` longer than the
/// configured per-job maximum. The node never reported in for these:
/// either it died mid-stream or the tunnel went away, and the transport
/// resources must not leak.
pub async fn run_watchdog(orchestrator: Arc<BackupOrchestrator>, max_duration_secs: u64) {
    let max_age = ChronoDuration::seconds(max_duration_secs as i64);

    loop {
        tokio::time::sleep(SCAN_INTERVAL).await;

        let cutoff = Utc::now() - max_age;
        let stale = match db::job::stale_running_jobs(orchestrator.pool(), cutoff).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Watchdog could not scan for stale jobs: {}", e);
                continue;
            }
        };

        for job in stale {
            warn!(
                "Job {} exceeded the per-job maximum ({}s); failing it",
                job.id, max_duration_secs
            );
            if let Err(e) = orchestrator
                .fail_and_cleanup(job.id, "job exceeded maximum duration")
                .await
            {
                error!("Watchdog cleanup of job {} failed: {}", job.id, e);
            }
        }
    }
}
