//! Error taxonomy for the DeviceBox update engine.
//!
//! Every failure the engine can report maps to exactly one [`ErrorKind`],
//! which is what the web layer and the CLI see alongside the message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::fsops::FsError;
use crate::version_store::VersionStoreError;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Release source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Release source returned an unexpected response: {0}")]
    SourceMalformed(String),

    #[error("No releases published")]
    NoReleases,

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Archive extraction failed: {0}")]
    ExtractFailed(String),

    #[error("Backup snapshot failed: {0}")]
    SnapshotFailed(#[source] FsError),

    #[error("Swapping install tree failed: {0}")]
    SwapFailed(#[source] FsError),

    #[error("Restoring preserved data failed: {0}")]
    DataRestoreFailed(#[source] FsError),

    #[error("Setting ownership/permissions failed: {0}")]
    PermissionsFailed(#[source] FsError),

    #[error("Service control failed: {0}")]
    ServiceControlFailed(String),

    #[error("Service {service} did not become active after {attempts} checks")]
    ServiceDidNotBecomeActive { service: String, attempts: u32 },

    #[error("Recording installed version failed: {0}")]
    RecordFailed(#[source] VersionStoreError),

    #[error("ROLLBACK FAILED after '{cause}': {detail}")]
    RollbackFailed {
        cause: Box<UpdateError>,
        detail: String,
        backup: Option<PathBuf>,
    },

    #[error("An update is already in progress")]
    UpdateInProgress,

    #[error("Version record is corrupt: {0}")]
    Corrupt(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Machine-readable error class, serialized into command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnreachable,
    SourceMalformed,
    NoReleases,
    DownloadFailed,
    ExtractFailed,
    SnapshotFailed,
    SwapFailed,
    DataRestoreFailed,
    PermissionsFailed,
    ServiceControlFailed,
    ServiceDidNotBecomeActive,
    RecordFailed,
    RollbackFailed,
    UpdateInProgress,
    Corrupt,
    Config,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::SourceUnreachable(_) => ErrorKind::SourceUnreachable,
            UpdateError::SourceMalformed(_) => ErrorKind::SourceMalformed,
            UpdateError::NoReleases => ErrorKind::NoReleases,
            UpdateError::DownloadFailed(_) => ErrorKind::DownloadFailed,
            UpdateError::ExtractFailed(_) => ErrorKind::ExtractFailed,
            UpdateError::SnapshotFailed(_) => ErrorKind::SnapshotFailed,
            UpdateError::SwapFailed(_) => ErrorKind::SwapFailed,
            UpdateError::DataRestoreFailed(_) => ErrorKind::DataRestoreFailed,
            UpdateError::PermissionsFailed(_) => ErrorKind::PermissionsFailed,
            UpdateError::ServiceControlFailed(_) => ErrorKind::ServiceControlFailed,
            UpdateError::ServiceDidNotBecomeActive { .. } => ErrorKind::ServiceDidNotBecomeActive,
            UpdateError::RecordFailed(_) => ErrorKind::RecordFailed,
            UpdateError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            UpdateError::UpdateInProgress => ErrorKind::UpdateInProgress,
            UpdateError::Corrupt(_) => ErrorKind::Corrupt,
            UpdateError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only a failed rollback needs an operator on site.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpdateError::RollbackFailed { .. })
    }

    /// Process exit code for a standalone invocation that ended in this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateError::RollbackFailed { .. } => 2,
            UpdateError::Config(_) => 64,
            _ => 1,
        }
    }

    /// The error that started a rollback, or self.
    pub fn root_cause(&self) -> &UpdateError {
        match self {
            UpdateError::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnreachable => "SourceUnreachable",
            ErrorKind::SourceMalformed => "SourceMalformed",
            ErrorKind::NoReleases => "NoReleases",
            ErrorKind::DownloadFailed => "DownloadFailed",
            ErrorKind::ExtractFailed => "ExtractFailed",
            ErrorKind::SnapshotFailed => "SnapshotFailed",
            ErrorKind::SwapFailed => "SwapFailed",
            ErrorKind::DataRestoreFailed => "DataRestoreFailed",
            ErrorKind::PermissionsFailed => "PermissionsFailed",
            ErrorKind::ServiceControlFailed => "ServiceControlFailed",
            ErrorKind::ServiceDidNotBecomeActive => "ServiceDidNotBecomeActive",
            ErrorKind::RecordFailed => "RecordFailed",
            ErrorKind::RollbackFailed => "RollbackFailed",
            ErrorKind::UpdateInProgress => "UpdateInProgress",
            ErrorKind::Corrupt => "Corrupt",
            ErrorKind::Config => "Config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
