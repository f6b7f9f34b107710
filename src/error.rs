use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

/// Result alias for bunkit operations.
pub type Result<T> = std::result::Result<T, BunkitError>;

/// Error domains surfaced by the install engine and runtime handle.
#[derive(Debug, Error)]
pub enum BunkitError {
    #[error("invalid version `{input}`: {reason}")]
    InvalidVersion { input: String, reason: String },
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("network: {0}")]
    Network(String),
    #[error("unexpected release response: {0}")]
    Protocol(String),
    #[error("`{name}` not found in the downloaded archive; did the release format change?")]
    ExecutableNotInArchive { name: String },
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },
    #[error("timed out after {}s waiting for install lock {}", timeout.as_secs(), path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BunkitError {
    /// True when another process held the install lock for the whole timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, BunkitError::LockTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BunkitError::Cancelled(_))
    }

    /// Map error category to a deterministic exit code.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            BunkitError::InvalidVersion { .. } => ExitCode::from(2),
            BunkitError::UnsupportedPlatform { .. } => ExitCode::from(10),
            BunkitError::Http(_) | BunkitError::Network(_) => ExitCode::from(30),
            BunkitError::Protocol(_) => ExitCode::from(31),
            BunkitError::ExecutableNotInArchive { .. } | BunkitError::Archive(_) => {
                ExitCode::from(32)
            }
            BunkitError::Manifest { .. } | BunkitError::Serialization(_) => ExitCode::from(40),
            BunkitError::Io(_) => ExitCode::from(41),
            BunkitError::LockTimeout { .. } => ExitCode::from(75),
            BunkitError::Cancelled(_) => ExitCode::from(130),
        }
    }
}
