use crate::node::protocol::NodeBackupRequest;
use crate::orchestrator::error::OrchestratorError;
use std::time::Duration;

/// HTTP client for the node API, reached over the reverse tunnel. The
/// orchestrator makes exactly one start call per VM-level job.
pub struct NodeDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl NodeDispatcher {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to build node HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Asks the node to snapshot the VM and stream all its disks. Returns
    /// once the node has accepted; streaming continues asynchronously on
    /// the node side.
    pub async fn start_backup(&self, request: &NodeBackupRequest) -> Result<(), OrchestratorError> {
        let url = format!("{}/backup/start", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| OrchestratorError::NodeUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::NodeRejected { status, detail });
        }

        Ok(())
    }

    /// Best-effort abort of a running job on the node. Errors are logged
    /// and swallowed; the hub-side failure cleanup proceeds regardless.
    pub async fn cancel_backup(&self, job_id: i64) {
        let url = format!("{}/backup/{}/cancel", self.base_url, job_id);
        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                log::info!("Node acknowledged cancel for job {}", job_id);
            }
            Ok(response) => {
                log::warn!(
                    "Node returned {} for cancel of job {}",
                    response.status(),
                    job_id
                );
            }
            Err(e) => {
                log::warn!("Could not reach node to cancel job {}: {}", job_id, e);
            }
        }
    }

    /// Pulls the VM inventory for the hub's managed-VM sync.
    pub async fn fetch_inventory(
        &self,
    ) -> Result<Vec<crate::node::protocol::InventoryVm>, OrchestratorError> {
        let url = format!("{}/inventory", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::NodeUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::NodeRejected { status, detail });
        }

        response
            .json()
            .await
            .map_err(|e| OrchestratorError::NodeUnreachable(format!("bad inventory body: {}", e)))
    }
}
