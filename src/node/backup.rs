//! The node backup client: takes one VM-level snapshot, streams every
//! disk's extents into its assigned NBD export in parallel, reports the
//! new CBT change ids to the hub's completion endpoint and always
//! releases the snapshot.

use crate::config::NodeConfig;
use crate::node::error::NodeError;
use crate::node::nbd::NbdClient;
use crate::node::protocol::{
    CompletionPayload, NodeBackupRequest, PerDiskCompletion, OVERALL_STATUS_COMPLETED,
    OVERALL_STATUS_FAILED,
};
use crate::node::vsphere::types::{ChangedArea, DiskRecord};
use crate::node::vsphere::{VSphereClient, CHANGE_ID_ALL};
use crate::orchestrator::targets::{parse_descriptor, NbdTarget};
use futures::stream::StreamExt;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Read granularity against the hypervisor. Extents are split into
/// chunks of this size and fetched with bounded parallelism per disk.
const CHUNK_BYTES: u64 = 4 * 1024 * 1024;

/// Tracks running jobs so the cancel endpoint can reach them. The flag is
/// polled between chunks; cancellation is best-effort by design.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<i64, Arc<AtomicBool>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: i64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.jobs.lock().await.insert(job_id, flag.clone());
        flag
    }

    pub async fn cancel(&self, job_id: i64) -> bool {
        match self.jobs.lock().await.get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn finish(&self, job_id: i64) {
        self.jobs.lock().await.remove(&job_id);
    }
}

/// Entry point for one accepted backup job. Runs in its own task; the
/// HTTP handler has already returned 202 by the time this does any work.
pub async fn run_backup(
    config: Arc<NodeConfig>,
    registry: Arc<JobRegistry>,
    request: NodeBackupRequest,
) {
    let job_id = request.job_id;
    let cancel = registry.register(job_id).await;

    let payload = match execute(&config, &request, &cancel).await {
        Ok(per_disk) => {
            info!("Job {} streamed successfully", job_id);
            CompletionPayload {
                per_disk,
                overall_status: OVERALL_STATUS_COMPLETED.to_string(),
                error: None,
            }
        }
        Err(e) => {
            error!("Job {} failed on the node: {}", job_id, e);
            CompletionPayload {
                per_disk: Vec::new(),
                overall_status: OVERALL_STATUS_FAILED.to_string(),
                error: Some(e.to_string()),
            }
        }
    };

    if let Err(e) = post_completion(&config, job_id, &payload).await {
        error!("Could not report completion of job {}: {}", job_id, e);
    }

    registry.finish(job_id).await;
}

async fn post_completion(
    config: &NodeConfig,
    job_id: i64,
    payload: &CompletionPayload,
) -> Result<(), NodeError> {
    let url = format!(
        "{}/api/v1/backups/{}/complete",
        config.hub_api_url.trim_end_matches('/'),
        job_id
    );

    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .bearer_auth(&config.callback_token)
        .json(payload)
        .send()
        .await?;

    if !response.status().is_success() {
        warn!(
            "Hub returned {} for completion of job {}",
            response.status(),
            job_id
        );
    }
    Ok(())
}

async fn execute(
    config: &Arc<NodeConfig>,
    request: &NodeBackupRequest,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<PerDiskCompletion>, NodeError> {
    let vsphere = Arc::new(VSphereClient::new(config.clone())?);
    vsphere.login().await?;

    let vm = vsphere.find_vm(&request.vm_name, &request.vmware_uuid).await?;
    let targets = parse_descriptor(&request.nbd_targets)?;

    // One snapshot spanning all disks; per-disk snapshots would tear
    // multi-disk application state apart.
    let snapshot = vsphere
        .create_snapshot(&vm.moref, &format!("corevault-job-{}", request.job_id))
        .await?;
    info!(
        "Job {}: snapshot {} created for '{}', streaming {} disks",
        request.job_id,
        snapshot,
        vm.name,
        targets.len()
    );

    let result = stream_all_disks(config, &vsphere, &vm.moref, &snapshot, &targets, request, cancel).await;

    // The snapshot is released no matter how streaming went.
    if let Err(e) = vsphere.remove_snapshot(&snapshot).await {
        warn!("Job {}: snapshot {} not released: {}", request.job_id, snapshot, e);
    }

    result
}

async fn stream_all_disks(
    config: &Arc<NodeConfig>,
    vsphere: &Arc<VSphereClient>,
    vm_moref: &str,
    snapshot: &str,
    targets: &[NbdTarget],
    request: &NodeBackupRequest,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<PerDiskCompletion>, NodeError> {
    // The snapshot refresh carries the disk records whose backing files
    // are now frozen, keyed by the hypervisor disk key.
    let disks = vsphere.refresh_disks(vm_moref).await?;
    let by_key: HashMap<i32, DiskRecord> = disks.into_iter().map(|d| (d.key, d)).collect();

    let mut streams = Vec::new();
    for (disk_index, target) in targets.iter().enumerate() {
        let disk = by_key
            .get(&target.disk_key)
            .cloned()
            .ok_or_else(|| {
                NodeError::Vsphere(format!("VM has no disk with key {}", target.disk_key))
            })?;

        let prior_change_id = request
            .previous_change_ids
            .get(&(disk_index as i32))
            .cloned()
            .unwrap_or_else(|| CHANGE_ID_ALL.to_string());

        let vsphere = vsphere.clone();
        let target = target.clone();
        let cancel = cancel.clone();
        let vm_moref = vm_moref.to_string();
        let snapshot = snapshot.to_string();
        let streams_per_disk = config.streams_per_disk;

        streams.push(async move {
            let bytes = stream_disk(
                &vsphere,
                &vm_moref,
                &snapshot,
                &disk,
                &target,
                &prior_change_id,
                streams_per_disk,
                &cancel,
            )
            .await?;
            Ok::<(i32, i32, u64), NodeError>((disk_index as i32, target.disk_key, bytes))
        });
    }

    let transferred = futures::future::try_join_all(streams).await?;

    // New change ids only exist on the hypervisor after the snapshot; a
    // disk without one cannot anchor future incrementals, which makes
    // the whole attempt useless.
    let refreshed = vsphere.refresh_disks(vm_moref).await?;
    let change_ids: HashMap<i32, String> = refreshed
        .into_iter()
        .filter_map(|d| d.change_id.map(|c| (d.key, c)))
        .collect();

    let mut per_disk = Vec::new();
    for (disk_index, disk_key, bytes) in transferred {
        let change_id = change_ids.get(&disk_key).cloned().ok_or_else(|| {
            NodeError::Vsphere(format!(
                "no change id for disk key {}; is CBT enabled on the VM?",
                disk_key
            ))
        })?;
        per_disk.push(PerDiskCompletion {
            disk_index,
            change_id,
            bytes_transferred: bytes as i64,
        });
    }
    per_disk.sort_by_key(|p| p.disk_index);

    Ok(per_disk)
}

/// Splits the changed areas of one disk into fixed-size chunks.
fn chunk_areas(areas: &[ChangedArea], chunk_bytes: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    for area in areas {
        let mut offset = area.start;
        let end = area.start + area.length;
        while offset < end {
            let length = chunk_bytes.min(end - offset);
            chunks.push((offset, length));
            offset += length;
        }
    }
    chunks
}

#[allow(clippy::too_many_arguments)]
async fn stream_disk(
    vsphere: &Arc<VSphereClient>,
    vm_moref: &str,
    snapshot: &str,
    disk: &DiskRecord,
    target: &NbdTarget,
    prior_change_id: &str,
    streams_per_disk: usize,
    cancel: &Arc<AtomicBool>,
) -> Result<u64, NodeError> {
    // Probe handle first: negotiate, learn the export size, keep it open
    // while the worker connects. Both handles count against the block
    // server's shared-connection limit.
    let probe = NbdClient::connect(&target.host, target.port, &target.export_name).await?;
    if (probe.size() as i64) < disk.capacity_bytes {
        warn!(
            "Export {} is {} bytes but disk key {} is {} bytes",
            target.export_name,
            probe.size(),
            disk.key,
            disk.capacity_bytes
        );
    }

    let mut worker = NbdClient::connect(&target.host, target.port, &target.export_name).await?;
    probe.disconnect().await?;

    let areas = vsphere
        .query_changed_areas(vm_moref, snapshot, disk.key, disk.capacity_bytes, prior_change_id)
        .await?;

    let (datastore, flat_path) = disk.flat_file_path().ok_or_else(|| {
        NodeError::Vsphere(format!("disk key {} has no parsable backing file", disk.key))
    })?;

    info!(
        "Disk key {}: {} extents into export '{}' (port {})",
        disk.key,
        areas.len(),
        target.export_name,
        target.port
    );

    let chunks = chunk_areas(&areas, CHUNK_BYTES);
    let mut bytes_written: u64 = 0;

    // Reads run ahead with bounded parallelism; writes stay ordered on
    // the single worker handle.
    let mut fetches = futures::stream::iter(chunks.into_iter().map(|(offset, length)| {
        let vsphere = vsphere.clone();
        let datastore = datastore.clone();
        let flat_path = flat_path.clone();
        async move {
            let data = vsphere
                .read_datastore_range(&datastore, &flat_path, offset, length)
                .await?;
            Ok::<(u64, Vec<u8>), NodeError>((offset, data))
        }
    }))
    .buffered(streams_per_disk.max(1));

    while let Some(fetch) = fetches.next().await {
        if cancel.load(Ordering::SeqCst) {
            return Err(NodeError::Cancelled);
        }
        let (offset, data) = fetch?;
        worker.write(offset, &data).await?;
        bytes_written += data.len() as u64;
    }
    drop(fetches);

    worker.flush().await?;
    worker.disconnect().await?;

    info!(
        "Disk key {}: {} bytes written to export '{}'",
        disk.key, bytes_written, target.export_name
    );
    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents_split_into_bounded_chunks() {
        let areas = vec![
            ChangedArea { start: 0, length: 10 * 1024 * 1024 },
            ChangedArea { start: 64 * 1024 * 1024, length: 1024 },
        ];
        let chunks = chunk_areas(&areas, CHUNK_BYTES);
        assert_eq!(
            chunks,
            vec![
                (0, CHUNK_BYTES),
                (CHUNK_BYTES, CHUNK_BYTES),
                (2 * CHUNK_BYTES, 2 * 1024 * 1024),
                (64 * 1024 * 1024, 1024),
            ]
        );
    }

    #[test]
    fn sparse_regions_are_never_chunked() {
        // A gap between areas produces no chunk; unallocated space is
        // simply skipped.
        let areas = vec![
            ChangedArea { start: 0, length: 512 },
            ChangedArea { start: 1 << 30, length: 512 },
        ];
        let chunks = chunk_areas(&areas, CHUNK_BYTES);
        assert_eq!(chunks, vec![(0, 512), (1 << 30, 512)]);
    }
}
