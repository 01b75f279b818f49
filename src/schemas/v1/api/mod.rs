use rocket::routes;

pub mod backups;
pub mod repositories;
pub mod restore;
pub mod vms;

pub fn routes() -> Vec<rocket::Route> {
    routes![
        // backups
        backups::start_backup,
        backups::complete_backup,
        backups::list_backups,
        backups::get_backup,
        backups::get_backup_disks,
        backups::get_backup_chain,
        backups::delete_backup,
        // restore
        restore::mount_backup_disk,
        restore::list_files,
        restore::download_file,
        restore::unmount,
        restore::list_mounts,
        // vms
        vms::list_vms,
        vms::sync_vms,
        // repositories
        repositories::list_repositories,
        repositories::create_repository,
    ]
}
