use std::io;

use crate::state::FailureCode;

/// Typed failure kinds. Callers usually receive these wrapped in
/// `anyhow::Error` and recover them with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("malformed update manifest: {0}")]
    MalformedManifest(String),

    #[error("status record not found: {0}")]
    StatusNotFound(String),

    #[error("install directory is held by another process: {0}")]
    LockContention(String),

    #[error("i/o failure while applying update: {0}")]
    Io(#[source] io::Error),

    #[error("disk full while applying update: {0}")]
    DiskFull(String),

    #[error("patch operation conflicts with installed files: {0}")]
    OperationConflict(String),

    #[error("patch payload failed integrity verification: {0}")]
    IntegrityFailure(String),

    #[error("failed merging alternate directory: {0}")]
    MergeFailure(String),

    #[error("failed launching application: {0}")]
    ProcessLaunchFailure(String),

    #[error("an update is already active (state={0})")]
    UpdateAlreadyActive(String),

    #[error("no active update is staged")]
    NoActiveUpdate,
}

impl UpdateError {
    /// Classifies a raw i/o error, separating out a full disk.
    pub fn from_io(err: io::Error) -> Self {
        if is_storage_full(&err) {
            return Self::DiskFull(err.to_string());
        }
        Self::Io(err)
    }

    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::MalformedManifest(_) => FailureCode::READ_ERROR,
            Self::StatusNotFound(_) => FailureCode::READ_ERROR,
            Self::LockContention(_) => FailureCode::LOCK_CONTENTION,
            Self::Io(_) => FailureCode::WRITE_ERROR,
            Self::DiskFull(_) => FailureCode::DISK_FULL,
            Self::OperationConflict(_) => FailureCode::OPERATION_CONFLICT,
            Self::IntegrityFailure(_) => FailureCode::INTEGRITY_FAILURE,
            Self::MergeFailure(_) => FailureCode::MERGE_FAILURE,
            Self::ProcessLaunchFailure(_)
            | Self::UpdateAlreadyActive(_)
            | Self::NoActiveUpdate => FailureCode::UNEXPECTED,
        }
    }
}

/// Code recorded in the status for an error chain. The outermost typed cause
/// wins; a bare i/o error counts as a write error.
pub fn failure_code_for(err: &anyhow::Error) -> FailureCode {
    if let Some(update) = err.downcast_ref::<UpdateError>() {
        return update.failure_code();
    }
    for cause in err.chain() {
        if let Some(update) = cause.downcast_ref::<UpdateError>() {
            return update.failure_code();
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if is_storage_full(io_err) {
                return FailureCode::DISK_FULL;
            }
            return FailureCode::WRITE_ERROR;
        }
    }
    FailureCode::UNEXPECTED
}

fn is_storage_full(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC on unix, ERROR_DISK_FULL on windows
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(28)
    }
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(112)
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
