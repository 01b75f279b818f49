use crate::transport::TransportError;
use rocket::http::Status;
use thiserror::Error;

/// Errors that can occur while orchestrating a VM backup. Every one of
/// these is fatal to the job; there is no inner retry. The caller decides
/// whether to retry the whole backup.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadInput(String),

    #[error("No completed parent backup for disk {disk_index}; run a full backup first")]
    NoParent { disk_index: i32 },

    #[error("NBD port pool exhausted")]
    Exhausted,

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Node rejected backup request ({status}): {detail}")]
    NodeRejected { status: u16, detail: String },

    #[error("Block server failure: {0}")]
    BlockServerFailed(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for OrchestratorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Exhausted { .. } => OrchestratorError::Exhausted,
            other => OrchestratorError::BlockServerFailed(other.to_string()),
        }
    }
}

impl OrchestratorError {
    /// Maps the error kind onto the control-plane HTTP surface.
    pub fn http_status(&self) -> Status {
        match self {
            OrchestratorError::NotFound(_) => Status::NotFound,
            OrchestratorError::BadInput(_) => Status::BadRequest,
            OrchestratorError::NoParent { .. } => Status::Conflict,
            OrchestratorError::Integrity(_) => Status::Conflict,
            OrchestratorError::Exhausted => Status::ServiceUnavailable,
            OrchestratorError::NodeUnreachable(_) => Status::BadGateway,
            OrchestratorError::NodeRejected { .. } => Status::BadGateway,
            OrchestratorError::BlockServerFailed(_) => Status::InternalServerError,
            OrchestratorError::Database(_) => Status::InternalServerError,
            OrchestratorError::Io(_) => Status::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_documented_status_codes() {
        assert_eq!(
            OrchestratorError::NotFound("vm".into()).http_status(),
            Status::NotFound
        );
        assert_eq!(
            OrchestratorError::NoParent { disk_index: 0 }.http_status(),
            Status::Conflict
        );
        assert_eq!(
            OrchestratorError::Exhausted.http_status(),
            Status::ServiceUnavailable
        );
        assert_eq!(
            OrchestratorError::NodeUnreachable("tunnel down".into()).http_status(),
            Status::BadGateway
        );
    }

    #[test]
    fn transport_exhaustion_converts_to_retriable_kind() {
        let err: OrchestratorError = TransportError::Exhausted { pool_size: 2 }.into();
        assert!(matches!(err, OrchestratorError::Exhausted));
    }
}
