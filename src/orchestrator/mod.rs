//! The backup orchestrator: single entry point that reserves transport
//! resources, instructs the node, records results and cleans up on every
//! failure path.

pub mod dispatch;
pub mod error;
pub mod targets;
pub mod watchdog;

use crate::config::ServerConfig;
use crate::node::protocol::{
    CompletionPayload, NodeBackupRequest, OVERALL_STATUS_COMPLETED, OVERALL_STATUS_FAILED,
};
use crate::schemas::v1::db::queries as db;
use crate::schemas::v1::models::backup::{BACKUP_TYPE_FULL, BACKUP_TYPE_INCREMENTAL};
use crate::transport::{BlockServerSupervisor, PortAllocator};
use chrono::Utc;
use dispatch::NodeDispatcher;
use error::OrchestratorError;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use targets::{build_descriptor, NbdTarget};
use tokio::process::Command;

/// Control-plane request to start a VM backup. Always VM-level; there is
/// deliberately no disk field.
#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    pub vm_name: String,
    pub repository_id: i64,
    pub backup_type: String,
    #[serde(default)]
    pub policy_id: Option<i64>,
}

/// What the caller gets back once the node has accepted the backup.
#[derive(Debug, Serialize)]
pub struct BackupStarted {
    pub backup_id: i64,
    pub vm_name: String,
    pub backup_type: String,
    pub disk_results: Vec<DiskResult>,
    pub nbd_targets_string: String,
}

#[derive(Debug, Serialize)]
pub struct DiskResult {
    pub disk_index: i32,
    pub nbd_port: u16,
    pub export_name: String,
    pub qcow2_path: String,
    pub status: String,
}

/// Outcome of a completion-endpoint call.
#[derive(Debug, PartialEq)]
pub enum CompletionOutcome {
    Applied,
    AlreadyAcknowledged,
}

/// Transport resources held by an in-flight start attempt. Cleanup runs
/// the reverse of acquisition: metadata first, then processes, then
/// ports, then files.
#[derive(Default)]
struct JobResources {
    job_id: Option<i64>,
    started_ports: Vec<u16>,
    allocated_ports: Vec<u16>,
    created_files: Vec<PathBuf>,
}

pub struct BackupOrchestrator {
    pool: Pool<MySql>,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<BlockServerSupervisor>,
    node: NodeDispatcher,
    config: Arc<ServerConfig>,
}

/// True when a repeated completion call carries the same terminal state
/// the store already recorded, making the call an idempotent no-op.
fn repeat_payload_matches(
    job_status: &str,
    disks: &[crate::schemas::v1::models::backup::BackupDisk],
    payload: &CompletionPayload,
) -> bool {
    if job_status != payload.overall_status {
        return false;
    }
    if payload.overall_status != OVERALL_STATUS_COMPLETED {
        return true;
    }
    payload.per_disk.iter().all(|entry| {
        disks.iter().any(|d| {
            d.disk_index == entry.disk_index
                && d.disk_change_id.as_deref() == Some(entry.change_id.as_str())
        })
    })
}

/// Keeps only characters that are safe in export names and repository
/// paths.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Export names follow `{vm}-disk{index}-{timestamp}`; unique per disk
/// within a job and human-readable in the block server's process list.
fn export_name_for(vm_name: &str, disk_index: i32, timestamp: &str) -> String {
    format!("{}-disk{}-{}", sanitize_name(vm_name), disk_index, timestamp)
}

/// QCOW2 files land under `{repo_root}/{vm}/disk-{index}/{timestamp}.qcow2`.
/// Incrementals reference their parent by backing file, so files must not
/// move once written.
fn qcow2_path_for(repo_root: &str, vm_name: &str, disk_index: i32, timestamp: &str) -> PathBuf {
    Path::new(repo_root)
        .join(sanitize_name(vm_name))
        .join(format!("disk-{}", disk_index))
        .join(format!("{}.qcow2", timestamp))
}

impl BackupOrchestrator {
    pub fn new(
        pool: Pool<MySql>,
        allocator: Arc<PortAllocator>,
        supervisor: Arc<BlockServerSupervisor>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let node = NodeDispatcher::new(
            &config.node_api_url,
            std::time::Duration::from_secs(config.node_request_timeout_secs),
        );
        Self {
            pool,
            allocator,
            supervisor,
            node,
            config,
        }
    }

    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    pub fn node(&self) -> &NodeDispatcher {
        &self.node
    }

    /// Starts a VM-level backup: resolves the VM, reserves transport for
    /// every disk, and makes exactly one call to the node carrying all of
    /// them, so VMware takes a single snapshot spanning the whole VM.
    ///
    /// Synchronous up to "accepted by node"; data transfer then proceeds
    /// asynchronously and lands on the completion endpoint.
    pub async fn start_backup(
        &self,
        request: BackupRequest,
    ) -> Result<BackupStarted, OrchestratorError> {
        if request.backup_type != BACKUP_TYPE_FULL && request.backup_type != BACKUP_TYPE_INCREMENTAL
        {
            return Err(OrchestratorError::BadInput(format!(
                "unknown backup_type '{}'",
                request.backup_type
            )));
        }

        let mut resources = JobResources::default();
        match self.start_backup_inner(&request, &mut resources).await {
            Ok(started) => Ok(started),
            Err(err) => {
                error!(
                    "Backup of '{}' failed during startup: {}",
                    request.vm_name, err
                );
                self.cleanup_start_failure(resources, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn start_backup_inner(
        &self,
        request: &BackupRequest,
        resources: &mut JobResources,
    ) -> Result<BackupStarted, OrchestratorError> {
        // Step 1: resolve the VM and its disks.
        let vm = db::vm::get_vm_by_name(&self.pool, &request.vm_name)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("VM '{}' is not managed", request.vm_name))
            })?;

        let disks = db::vm::disks_for_vm(&self.pool, vm.id).await?;
        if disks.is_empty() {
            return Err(OrchestratorError::BadInput(format!(
                "VM '{}' has no disks in inventory",
                request.vm_name
            )));
        }

        let repository = db::repository::get_repository_by_id(&self.pool, request.repository_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "repository {} does not exist",
                    request.repository_id
                ))
            })?;

        // Step 2: persistent context and the running job row.
        let context_id =
            db::context::ensure_context(&self.pool, &vm.name, &vm.vmware_uuid, repository.id)
                .await?;
        let job_id =
            db::job::create_job(&self.pool, context_id, &request.backup_type, request.policy_id)
                .await?;
        resources.job_id = Some(job_id);

        info!(
            "Job {} started: {} backup of '{}' ({} disks) into repository '{}'",
            job_id,
            request.backup_type,
            vm.name,
            disks.len(),
            repository.name
        );

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();

        // Step 3: per-disk QCOW2 files and disk rows, in index order.
        let mut previous_change_ids: HashMap<i32, String> = HashMap::new();
        let mut disk_paths: Vec<(i32, i32, PathBuf, i64)> = Vec::new();

        for disk in &disks {
            let path = qcow2_path_for(&repository.root_path, &vm.name, disk.disk_index, &timestamp);

            if request.backup_type == BACKUP_TYPE_INCREMENTAL {
                let parent = db::disk::latest_completed_disk(&self.pool, context_id, disk.disk_index)
                    .await?
                    .ok_or(OrchestratorError::NoParent {
                        disk_index: disk.disk_index,
                    })?;
                let change_id = parent.disk_change_id.clone().ok_or_else(|| {
                    OrchestratorError::Integrity(format!(
                        "completed disk {} has no change id",
                        parent.id
                    ))
                })?;

                self.create_qcow2_backed(&path, Path::new(&parent.qcow2_path))
                    .await?;
                previous_change_ids.insert(disk.disk_index, change_id);
            } else {
                self.create_qcow2(&path, disk.capacity_bytes).await?;
            }
            resources.created_files.push(path.clone());

            db::disk::create_disk(
                &self.pool,
                job_id,
                disk.disk_index,
                disk.vmware_disk_key,
                &path.to_string_lossy(),
                disk.capacity_bytes,
            )
            .await?;

            disk_paths.push((disk.disk_index, disk.vmware_disk_key, path, disk.capacity_bytes));
        }

        // Step 4: one port and one block server per disk.
        let owner_tag = job_id.to_string();
        let mut nbd_targets: Vec<NbdTarget> = Vec::new();
        let mut disk_results: Vec<DiskResult> = Vec::new();

        for (disk_index, disk_key, path, _size) in &disk_paths {
            let port = self.allocator.allocate(&owner_tag)?;
            resources.allocated_ports.push(port);

            let export_name = export_name_for(&vm.name, *disk_index, &timestamp);
            self.supervisor
                .start(job_id, port, &export_name, &path.to_string_lossy())
                .await?;
            resources.started_ports.push(port);

            nbd_targets.push(NbdTarget {
                disk_key: *disk_key,
                host: "127.0.0.1".to_string(),
                port,
                export_name: export_name.clone(),
            });
            disk_results.push(DiskResult {
                disk_index: *disk_index,
                nbd_port: port,
                export_name,
                qcow2_path: path.to_string_lossy().into_owned(),
                status: "running".to_string(),
            });
        }

        // Step 5/6: the single node call carrying all disks. The targets
        // are addressed by hypervisor disk key; the node treats the
        // descriptor as authoritative for disk-to-export mapping.
        let nbd_targets_string = build_descriptor(&nbd_targets);
        let node_request = NodeBackupRequest {
            job_id,
            vm_name: vm.name.clone(),
            vmware_uuid: vm.vmware_uuid.clone(),
            backup_type: request.backup_type.clone(),
            nbd_targets: nbd_targets_string.clone(),
            previous_change_ids,
        };

        self.node.start_backup(&node_request).await?;

        info!(
            "Job {} accepted by node; streaming {} disks",
            job_id,
            disk_results.len()
        );

        Ok(BackupStarted {
            backup_id: job_id,
            vm_name: vm.name,
            backup_type: request.backup_type.clone(),
            disk_results,
            nbd_targets_string,
        })
    }

    /// Creates an empty QCOW2 sized to the source disk.
    async fn create_qcow2(&self, path: &Path, size_bytes: i64) -> Result<(), OrchestratorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let status = Command::new(&self.config.qemu_img_path)
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg(path)
            .arg(size_bytes.to_string())
            .status()
            .await?;

        if !status.success() {
            return Err(OrchestratorError::Io(std::io::Error::other(format!(
                "qemu-img create failed for {} ({})",
                path.display(),
                status
            ))));
        }
        Ok(())
    }

    /// Creates a QCOW2 whose backing file is the parent of the chain; the
    /// new image inherits the parent's virtual size.
    async fn create_qcow2_backed(&self, path: &Path, parent: &Path) -> Result<(), OrchestratorError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let status = Command::new(&self.config.qemu_img_path)
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg("-b")
            .arg(parent)
            .arg("-F")
            .arg("qcow2")
            .arg(path)
            .status()
            .await?;

        if !status.success() {
            return Err(OrchestratorError::Io(std::io::Error::other(format!(
                "qemu-img create (backed) failed for {} ({})",
                path.display(),
                status
            ))));
        }
        Ok(())
    }

    /// Failure cleanup for a start attempt: fail the job row, stop every
    /// started block server, release every allocated port, remove every
    /// partially-created QCOW2. Each action is idempotent.
    async fn cleanup_start_failure(&self, resources: JobResources, error_msg: &str) {
        if let Some(job_id) = resources.job_id {
            if let Err(e) = db::job::fail_job(&self.pool, job_id, error_msg).await {
                error!("Failed to mark job {} failed: {}", job_id, e);
            }
            let disks = db::disk::disks_for_job(&self.pool, job_id).await.unwrap_or_default();
            for disk in disks {
                let _ = db::disk::fail_disk(&self.pool, disk.id).await;
            }
        }

        for port in resources.started_ports.iter().rev() {
            self.supervisor.stop(*port).await;
        }
        for port in resources.allocated_ports.iter().rev() {
            self.allocator.release(*port);
        }
        for path in resources.created_files.iter().rev() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Applies the node's completion report for a job (the completion
    /// endpoint's logic).
    ///
    /// Metadata commits strictly before transport teardown: a crash
    /// between the two leaves orphan block servers, which are
    /// discoverable, rather than orphan metadata, which is not.
    pub async fn handle_completion(
        &self,
        job_id: i64,
        payload: &CompletionPayload,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        let job = db::job::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {} does not exist", job_id)))?;

        if job.status != "running" {
            return self.acknowledge_repeat(&job, payload).await;
        }

        match payload.overall_status.as_str() {
            OVERALL_STATUS_COMPLETED => {
                let disks = db::disk::disks_for_job(&self.pool, job_id).await?;

                // Every disk of the job must be covered; a partial payload
                // would leave a completed job with running disks.
                for disk in &disks {
                    if !payload.per_disk.iter().any(|p| p.disk_index == disk.disk_index) {
                        return Err(OrchestratorError::BadInput(format!(
                            "completion payload missing disk_index {}",
                            disk.disk_index
                        )));
                    }
                }

                for entry in &payload.per_disk {
                    let disk = db::disk::disk_for_job_index(&self.pool, job_id, entry.disk_index)
                        .await?
                        .ok_or_else(|| {
                            OrchestratorError::BadInput(format!(
                                "job {} has no disk_index {}",
                                job_id, entry.disk_index
                            ))
                        })?;
                    db::disk::complete_disk(
                        &self.pool,
                        disk.id,
                        &entry.change_id,
                        entry.bytes_transferred,
                    )
                    .await?;
                }

                db::job::complete_job(&self.pool, job_id).await?;
                info!("Job {} completed; tearing down transport", job_id);

                self.teardown_transport(job_id).await;
                Ok(CompletionOutcome::Applied)
            }
            OVERALL_STATUS_FAILED => {
                let reason = payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "node reported failure".to_string());
                self.fail_and_cleanup(job_id, &reason).await?;
                Ok(CompletionOutcome::Applied)
            }
            other => Err(OrchestratorError::BadInput(format!(
                "unknown overall_status '{}'",
                other
            ))),
        }
    }

    /// Second and later completion calls: a no-op acknowledgment when the
    /// payload matches the recorded terminal state, a conflict otherwise.
    async fn acknowledge_repeat(
        &self,
        job: &crate::schemas::v1::models::backup::BackupJob,
        payload: &CompletionPayload,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        let disks = db::disk::disks_for_job(&self.pool, job.id).await?;
        if !repeat_payload_matches(&job.status, &disks, payload) {
            return Err(OrchestratorError::Integrity(format!(
                "job {} is {}, not running",
                job.id, job.status
            )));
        }
        Ok(CompletionOutcome::AlreadyAcknowledged)
    }

    /// Fails a running job and reclaims everything it holds: disk rows,
    /// transport leases, ports and the partially-written QCOW2 files
    /// (useless without a recorded change id).
    pub async fn fail_and_cleanup(
        &self,
        job_id: i64,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let disks = db::disk::disks_for_job(&self.pool, job_id).await?;

        for disk in &disks {
            db::disk::fail_disk(&self.pool, disk.id).await?;
        }
        db::job::fail_job(&self.pool, job_id, reason).await?;

        self.teardown_transport(job_id).await;

        for disk in &disks {
            if let Err(e) = tokio::fs::remove_file(&disk.qcow2_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", disk.qcow2_path, e);
                }
            }
        }

        Ok(())
    }

    /// Stops every block server of a job and frees its ports. Also sweeps
    /// allocator entries that never got a lease (startup raced a crash).
    async fn teardown_transport(&self, job_id: i64) {
        let stopped = self.supervisor.stop_all(job_id).await;
        for port in stopped {
            self.allocator.release(port);
        }

        let owner_tag = job_id.to_string();
        for (port, owner) in self.allocator.in_use() {
            if owner == owner_tag {
                self.allocator.release(port);
            }
        }
    }

    /// Cancels a running job: best-effort node abort, then the standard
    /// failure cleanup. Data already written is discarded.
    pub async fn cancel_backup(&self, job_id: i64) -> Result<(), OrchestratorError> {
        let job = db::job::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {} does not exist", job_id)))?;

        if job.status != "running" {
            return Err(OrchestratorError::BadInput(format!(
                "job {} is {}, not running",
                job_id, job.status
            )));
        }

        self.node.cancel_backup(job_id).await;
        self.fail_and_cleanup(job_id, "cancelled by operator").await
    }

    /// Deletes a terminal job and its files, refusing while any disk is
    /// the backing file of a newer backup in its chain.
    pub async fn delete_backup(&self, job_id: i64) -> Result<(), OrchestratorError> {
        let job = db::job::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {} does not exist", job_id)))?;

        if job.status == "running" {
            return Err(OrchestratorError::BadInput(
                "job is running; cancel it instead".to_string(),
            ));
        }

        let disks = db::disk::disks_for_job(&self.pool, job_id).await?;
        for disk in &disks {
            if disk.status == "completed"
                && db::disk::has_chain_descendant(
                    &self.pool,
                    job.context_id,
                    disk.disk_index,
                    disk.id,
                )
                .await?
            {
                return Err(OrchestratorError::Integrity(format!(
                    "disk {} is the backing file of a newer backup",
                    disk.disk_index
                )));
            }
        }

        db::job::delete_job(&self.pool, job_id).await?;

        for disk in &disks {
            if let Err(e) = tokio::fs::remove_file(&disk.qcow2_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", disk.qcow2_path, e);
                }
            }
        }

        info!("Deleted backup job {} ({} disks)", job_id, disks.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::protocol::PerDiskCompletion;
    use crate::schemas::v1::models::backup::BackupDisk;

    fn completed_disk(disk_index: i32, change_id: &str) -> BackupDisk {
        BackupDisk {
            id: disk_index as i64 + 1,
            job_id: 1,
            disk_index,
            vmware_disk_key: 2000 + disk_index,
            qcow2_path: format!("/repo/vm/disk-{}/t.qcow2", disk_index),
            size_bytes: 1 << 30,
            bytes_transferred: Some(1024),
            disk_change_id: Some(change_id.to_string()),
            status: "completed".to_string(),
        }
    }

    fn completed_payload(entries: &[(i32, &str)]) -> CompletionPayload {
        CompletionPayload {
            per_disk: entries
                .iter()
                .map(|(disk_index, change_id)| PerDiskCompletion {
                    disk_index: *disk_index,
                    change_id: change_id.to_string(),
                    bytes_transferred: 1024,
                })
                .collect(),
            overall_status: OVERALL_STATUS_COMPLETED.to_string(),
            error: None,
        }
    }

    #[test]
    fn identical_repeat_completion_is_acknowledged() {
        let disks = vec![completed_disk(0, "52/1"), completed_disk(1, "52/2")];
        let payload = completed_payload(&[(0, "52/1"), (1, "52/2")]);
        assert!(repeat_payload_matches("completed", &disks, &payload));
    }

    #[test]
    fn diverging_repeat_completion_is_a_conflict() {
        let disks = vec![completed_disk(0, "52/1")];
        let payload = completed_payload(&[(0, "52/9")]);
        assert!(!repeat_payload_matches("completed", &disks, &payload));
    }

    #[test]
    fn repeat_with_a_different_status_is_a_conflict() {
        let disks = vec![completed_disk(0, "52/1")];
        let payload = completed_payload(&[(0, "52/1")]);
        assert!(!repeat_payload_matches("failed", &disks, &payload));
    }

    #[test]
    fn repeated_failure_report_matches_without_disk_comparison() {
        let payload = CompletionPayload {
            per_disk: Vec::new(),
            overall_status: "failed".to_string(),
            error: Some("stream broke".to_string()),
        };
        assert!(repeat_payload_matches("failed", &[], &payload));
    }

    #[test]
    fn export_names_embed_vm_disk_and_timestamp() {
        let name = export_name_for("alpha", 0, "20260801T120000");
        assert_eq!(name, "alpha-disk0-20260801T120000");
    }

    #[test]
    fn export_names_sanitize_awkward_vm_names() {
        let name = export_name_for("db server (prod)", 1, "20260801T120000");
        assert!(!name.contains(' '));
        assert!(!name.contains('('));
        assert!(name.starts_with("db-server"));
    }

    #[test]
    fn qcow2_paths_follow_repository_layout() {
        let path = qcow2_path_for("/repo", "alpha", 1, "20260801T120000");
        assert_eq!(
            path,
            PathBuf::from("/repo/alpha/disk-1/20260801T120000.qcow2")
        );
    }

    #[test]
    fn qcow2_paths_cannot_escape_the_repository() {
        let path = qcow2_path_for("/repo", "../../etc", 0, "t");
        assert!(path.starts_with("/repo"));
        assert!(!path.to_string_lossy().contains(".."));
    }
}
