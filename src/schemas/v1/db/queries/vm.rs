use crate::schemas::v1::models::vm::{Vm, VmDisk};
use sqlx::{MySql, Pool};

pub async fn list_vms(pool: &Pool<MySql>) -> Result<Vec<Vm>, sqlx::Error> {
    sqlx::query_as::<_, Vm>("SELECT * FROM vms ORDER BY name")
        .fetch_all(pool)
        .await
}

pub async fn get_vm_by_name(pool: &Pool<MySql>, name: &str) -> Result<Option<Vm>, sqlx::Error> {
    sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Disks of a VM in stable index order. The orchestrator relies on this
/// ordering when it builds the multi-target descriptor.
pub async fn disks_for_vm(pool: &Pool<MySql>, vm_id: i64) -> Result<Vec<VmDisk>, sqlx::Error> {
    sqlx::query_as::<_, VmDisk>("SELECT * FROM vm_disks WHERE vm_id = ? ORDER BY disk_index")
        .bind(vm_id)
        .fetch_all(pool)
        .await
}

/// Upserts one VM and replaces its disk set. Called from the inventory
/// sync; the disk set is small, so delete-and-reinsert keeps it simple.
pub async fn upsert_vm(
    pool: &Pool<MySql>,
    name: &str,
    vmware_uuid: &str,
    power_state: Option<&str>,
    disks: &[(i32, i32, i32, i64, Option<String>)], // (index, key, unit, capacity, backing)
) -> Result<i64, sqlx::Error> {
    tracing::info!(vm = name, disks = disks.len(), "Syncing VM inventory row");

    sqlx::query(
        "INSERT INTO vms (name, vmware_uuid, power_state) VALUES (?, ?, ?)
         ON DUPLICATE KEY UPDATE name = VALUES(name), power_state = VALUES(power_state)",
    )
    .bind(name)
    .bind(vmware_uuid)
    .bind(power_state)
    .execute(pool)
    .await?;

    let vm_id: i64 = sqlx::query_scalar("SELECT id FROM vms WHERE vmware_uuid = ?")
        .bind(vmware_uuid)
        .fetch_one(pool)
        .await?;

    sqlx::query("DELETE FROM vm_disks WHERE vm_id = ?")
        .bind(vm_id)
        .execute(pool)
        .await?;

    for (disk_index, disk_key, unit_number, capacity, backing) in disks {
        sqlx::query(
            "INSERT INTO vm_disks (vm_id, disk_index, vmware_disk_key, unit_number, capacity_bytes, backing_file)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(vm_id)
        .bind(disk_index)
        .bind(disk_key)
        .bind(unit_number)
        .bind(capacity)
        .bind(backing.as_deref())
        .execute(pool)
        .await?;
    }

    Ok(vm_id)
}
