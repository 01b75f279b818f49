use crate::transport::error::TransportError;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// The node-side client opens a probe handle and a worker handle per
/// export during negotiation. A shared-connection limit of 1 makes the
/// second handle block forever with no error, so this floor is a hard
/// requirement, with headroom for future parallelism.
const SHARED_CONNECTIONS: u32 = 10;

/// How long to wait for a freshly spawned block server to accept.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Binds a port, an export name, a QCOW2 path and a block-server process
/// to the job that owns them.
#[derive(Debug, Clone)]
pub struct TransportLease {
    pub port: u16,
    pub owner_job_id: i64,
    pub export_name: String,
    pub qcow2_path: String,
    pub pid: u32,
}

struct LeaseEntry {
    lease: TransportLease,
    child: Child,
}

/// Owns the lifecycle of the per-disk QCOW2 block servers.
///
/// An unexpected block-server exit is terminal for its lease: the backup
/// fails and is retried end-to-end, because the VMware snapshot and CBT
/// state are already committed to that attempt. The supervisor never
/// restarts a server.
pub struct BlockServerSupervisor {
    qemu_nbd_path: String,
    leases: Mutex<HashMap<u16, LeaseEntry>>,
    /// QCOW2 paths with a server mid-startup, before a lease exists.
    /// Keeps the one-writer-per-file check atomic without holding the
    /// lease lock across the startup wait.
    starting_paths: parking_lot::Mutex<std::collections::HashSet<String>>,
}

/// Arguments for one block-server invocation. The export serves a single
/// QCOW2 file on a single TCP port, persistent across client disconnects.
fn block_server_args(port: u16, export_name: &str, qcow2_path: &str) -> Vec<String> {
    vec![
        "--format".to_string(),
        "qcow2".to_string(),
        "--bind".to_string(),
        "0.0.0.0".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--export-name".to_string(),
        export_name.to_string(),
        "--shared".to_string(),
        SHARED_CONNECTIONS.to_string(),
        "--persist".to_string(),
        qcow2_path.to_string(),
    ]
}

impl BlockServerSupervisor {
    pub fn new(qemu_nbd_path: &str) -> Self {
        Self {
            qemu_nbd_path: qemu_nbd_path.to_string(),
            leases: Mutex::new(HashMap::new()),
            starting_paths: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Reserves the path for a startup attempt, failing if any live lease
    /// or concurrent startup already writes to it.
    async fn reserve_path(&self, qcow2_path: &str) -> Result<(), TransportError> {
        let leases = self.leases.lock().await;
        if let Some(entry) = leases.values().find(|e| e.lease.qcow2_path == qcow2_path) {
            warn!(
                "Refusing to start block server for {}: already exported on port {}",
                qcow2_path, entry.lease.port
            );
            return Err(TransportError::PathBusy(qcow2_path.to_string()));
        }
        if !self.starting_paths.lock().insert(qcow2_path.to_string()) {
            return Err(TransportError::PathBusy(qcow2_path.to_string()));
        }
        Ok(())
    }

    fn unreserve_path(&self, qcow2_path: &str) {
        self.starting_paths.lock().remove(qcow2_path);
    }

    /// Spawns a block server and waits for its port to start accepting.
    ///
    /// On any startup failure the child is reaped and no lease is
    /// recorded, so the caller only has the port itself to return.
    /// Startup attempts for different disks proceed concurrently; only
    /// the lease bookkeeping is serialized.
    pub async fn start(
        &self,
        owner_job_id: i64,
        port: u16,
        export_name: &str,
        qcow2_path: &str,
    ) -> Result<TransportLease, TransportError> {
        // At most one writer per QCOW2 file, ever.
        self.reserve_path(qcow2_path).await?;

        let result = self
            .spawn_and_wait(owner_job_id, port, export_name, qcow2_path)
            .await;
        self.unreserve_path(qcow2_path);
        result
    }

    async fn spawn_and_wait(
        &self,
        owner_job_id: i64,
        port: u16,
        export_name: &str,
        qcow2_path: &str,
    ) -> Result<TransportLease, TransportError> {
        let mut child = Command::new(&self.qemu_nbd_path)
            .args(block_server_args(port, export_name, qcow2_path))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| TransportError::SpawnFailed("no pid for spawned child".into()))?;

        // Poll until the port accepts or the child dies.
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| TransportError::SpawnFailed(e.to_string()))?
            {
                return Err(TransportError::DiedOnStartup {
                    port,
                    detail: format!("exit status {}", status),
                });
            }

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(TransportError::PortNeverOpened { port });
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let lease = TransportLease {
            port,
            owner_job_id,
            export_name: export_name.to_string(),
            qcow2_path: qcow2_path.to_string(),
            pid,
        };

        info!(
            "Block server up: port {}, export '{}', pid {}, file {}",
            port, export_name, pid, qcow2_path
        );

        self.leases
            .lock()
            .await
            .insert(port, LeaseEntry { lease: lease.clone(), child });
        Ok(lease)
    }

    /// Stops the block server on `port` and removes its lease. Idempotent;
    /// stopping a port with no lease is a no-op.
    pub async fn stop(&self, port: u16) {
        let entry = self.leases.lock().await.remove(&port);
        let Some(mut entry) = entry else {
            return;
        };

        info!(
            "Stopping block server on port {} (pid {})",
            port, entry.lease.pid
        );

        // Graceful first: SIGTERM, bounded wait, then SIGKILL.
        let _ = Command::new("kill")
            .arg(entry.lease.pid.to_string())
            .status()
            .await;

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        let mut exited = false;
        while tokio::time::Instant::now() < deadline {
            match entry.child.try_wait() {
                Ok(Some(_)) => {
                    exited = true;
                    break;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(250)).await,
                Err(_) => break,
            }
        }

        if !exited {
            warn!("Block server on port {} ignored SIGTERM, killing", port);
            let _ = entry.child.kill().await;
        }

        // Give the kernel a moment to release the file lock before anyone
        // reuses the QCOW2 (e.g. as a backing file or restore mount).
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    /// Stops every lease owned by `job_id` and returns the ports freed so
    /// the caller can hand them back to the allocator.
    pub async fn stop_all(&self, job_id: i64) -> Vec<u16> {
        let ports: Vec<u16> = {
            let leases = self.leases.lock().await;
            leases
                .values()
                .filter(|e| e.lease.owner_job_id == job_id)
                .map(|e| e.lease.port)
                .collect()
        };

        for port in &ports {
            self.stop(*port).await;
        }
        ports
    }

    /// Snapshot of live leases, keyed by port.
    pub async fn leases(&self) -> Vec<TransportLease> {
        self.leases.lock().await.values().map(|e| e.lease.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_server_args_carry_shared_connection_floor() {
        let args = block_server_args(10105, "alpha-disk0-20260801T120000", "/repo/a.qcow2");
        let shared_pos = args.iter().position(|a| a == "--shared").unwrap();
        let shared: u32 = args[shared_pos + 1].parse().unwrap();
        assert!(shared >= 10, "probe + worker handles both count");
        assert!(args.contains(&"--persist".to_string()));
        assert_eq!(args.last().unwrap(), "/repo/a.qcow2");
    }

    #[test]
    fn block_server_args_bind_all_interfaces_on_requested_port() {
        let args = block_server_args(10100, "e", "/x.qcow2");
        let bind_pos = args.iter().position(|a| a == "--bind").unwrap();
        assert_eq!(args[bind_pos + 1], "0.0.0.0");
        let port_pos = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port_pos + 1], "10100");
    }
}
