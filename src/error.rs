use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub const RELEASE_QUERY: &str = "checking latest release";
pub const PACKAGE_DOWNLOAD: &str = "downloading package";

/// Pipeline stage a failure is attributed to when it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    VersionCheck,
    Backup,
    Download,
    Extract,
    Install,
    Rollback,
    Launch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::VersionCheck => "version check",
            Stage::Backup => "backup",
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Install => "install",
            Stage::Rollback => "rollback",
            Stage::Launch => "launch",
        };
        f.write_str(name)
    }
}

/// Tagged failure kinds returned by every stage of the update pipeline.
///
/// Everything up to and including [`UpdateError::Inspection`] happens before the
/// installation directory is touched and is always safe to retry. Displacement and
/// installation failures are only returned after a successful rollback; a failed
/// rollback is reported as [`UpdateError::RollbackFailed`].
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("installed version unavailable: {0}")]
    VersionUnavailable(String),

    #[error("network unavailable while {operation}: {reason}")]
    Network {
        operation: &'static str,
        reason: String,
    },

    #[error("invalid release metadata: {0}")]
    Parse(String),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("failed to stage package at {path}: {reason}")]
    Download { path: PathBuf, reason: String },

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("failed to inspect {path}: {source}")]
    Inspection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to displace {path}: {source}")]
    DisplacementFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install {path}: {source}")]
    InstallationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "rollback after '{cause}' left the installation inconsistent ({}); displaced files are kept in {}",
        .failures.join("; "),
        .quarantine.display()
    )]
    RollbackFailed {
        cause: Box<UpdateError>,
        failures: Vec<String>,
        /// Holds the original files that could not be moved back.
        quarantine: PathBuf,
    },

    #[error("another updater already holds {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to launch {path}: {source}")]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("transaction is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UpdateError {
    pub fn network(operation: &'static str, err: impl fmt::Display) -> Self {
        UpdateError::Network {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, UpdateError::Network { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            UpdateError::VersionUnavailable(_) | UpdateError::Parse(_) => Stage::VersionCheck,
            UpdateError::Network { operation, .. } if *operation == PACKAGE_DOWNLOAD => {
                Stage::Download
            }
            UpdateError::Network { .. } => Stage::VersionCheck,
            UpdateError::BackupFailed(_) => Stage::Backup,
            UpdateError::Download { .. } => Stage::Download,
            UpdateError::ExtractionFailed(_) => Stage::Extract,
            UpdateError::Inspection { .. }
            | UpdateError::DisplacementFailed { .. }
            | UpdateError::InstallationFailed { .. }
            | UpdateError::InvalidState { .. }
            | UpdateError::AlreadyRunning(_) => Stage::Install,
            UpdateError::RollbackFailed { .. } => Stage::Rollback,
            UpdateError::LaunchFailed { .. } => Stage::Launch,
            UpdateError::Config(_) | UpdateError::Io(_) => Stage::VersionCheck,
        }
    }

    /// Process exit status for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            UpdateError::Network { .. } => 1,
            UpdateError::BackupFailed(_) => 2,
            UpdateError::Parse(_)
            | UpdateError::Download { .. }
            | UpdateError::ExtractionFailed(_)
            | UpdateError::Inspection { .. }
            | UpdateError::DisplacementFailed { .. }
            | UpdateError::InstallationFailed { .. } => 3,
            UpdateError::RollbackFailed { .. } => 4,
            UpdateError::VersionUnavailable(_)
            | UpdateError::AlreadyRunning(_)
            | UpdateError::LaunchFailed { .. }
            | UpdateError::Config(_)
            | UpdateError::InvalidState { .. }
            | UpdateError::Io(_) => 5,
        }
    }
}
