use rocket::http::Status;
use thiserror::Error;

/// Errors from the restore mount service
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadInput(String),

    #[error("Disk {0} already has an active restore mount")]
    AlreadyMounted(i64),

    #[error("No free kernel NBD device available")]
    NoFreeDevice,

    #[error("Failed to attach QCOW2 to {device}: {detail}")]
    AttachFailed { device: String, detail: String },

    #[error("No partition of the disk could be mounted")]
    NothingMounted,

    #[error("Path escapes the mount: {0}")]
    PathEscape(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    pub fn http_status(&self) -> Status {
        match self {
            RestoreError::NotFound(_) => Status::NotFound,
            RestoreError::BadInput(_) | RestoreError::PathEscape(_) => Status::BadRequest,
            RestoreError::AlreadyMounted(_) => Status::Conflict,
            RestoreError::NoFreeDevice => Status::ServiceUnavailable,
            RestoreError::AttachFailed { .. }
            | RestoreError::NothingMounted
            | RestoreError::Database(_)
            | RestoreError::Io(_) => Status::InternalServerError,
        }
    }
}
