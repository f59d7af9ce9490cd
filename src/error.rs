//! Error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for override operations.
pub type Result<T> = std::result::Result<T, OverrideError>;

/// Broad failure classes, used for exit codes and for deciding whether a
/// failure happened before or after host state was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Nothing was mutated yet (address discovery, bad configuration).
    Preflight,
    /// A prior instance or the system resolver could not be stopped.
    ConflictResolution,
    /// The forwarder could not be started or did not survive startup.
    Launch,
    /// The forwarder exited abnormally while running.
    Runtime,
    /// The system resolver could not be reactivated.
    Restoration,
}

impl FailureKind {
    /// Process exit code reported to the operator.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Preflight => 1,
            Self::ConflictResolution => 2,
            Self::Launch => 3,
            Self::Runtime => 4,
            Self::Restoration => 5,
        }
    }
}

/// Errors returned by override operations.
#[derive(Debug, Error)]
pub enum OverrideError {
    /// No interface carries a usable address.
    #[error(
        "no routable IPv4 address found (probed {probed}, then scanned for private ranges); \
         check that this machine is connected to the same network as the device (`ip -4 addr`)"
    )]
    AddressNotFound {
        /// Interfaces that were probed by name.
        probed: String,
    },

    /// Invalid configuration values.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A work directory is missing protections (foreign owner, shared
    /// write access, symlink).
    #[error("unsafe work directory: {source}")]
    UnsafeDirectory {
        /// Offending directory.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Signal handlers could not be installed.
    #[error("could not install signal handlers: {0}")]
    SignalSetup(#[source] std::io::Error),

    /// Stopping a prior instance or the resolver service failed.
    #[error("could not {action}: {source}")]
    ConflictResolution {
        /// What was being attempted.
        action: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The runtime configuration could not be written.
    #[error("could not write {}: {source}", .path.display())]
    ConfigWrite {
        /// Artifact location.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The forwarder process could not be spawned.
    #[error("could not start {binary}: {source}")]
    Spawn {
        /// Forwarder binary.
        binary: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The forwarder exited during its startup window.
    #[error("{binary} exited during startup ({status}); is port 53 still in use?")]
    StartupExit {
        /// Forwarder binary.
        binary: String,
        /// Human-readable exit status.
        status: String,
    },

    /// The forwarder exited abnormally after startup.
    #[error("{binary} exited unexpectedly ({status})")]
    UnexpectedExit {
        /// Forwarder binary.
        binary: String,
        /// Human-readable exit status.
        status: String,
    },

    /// Waiting on or stopping the forwarder failed.
    #[error("lost track of the forwarder process: {0}")]
    Supervision(#[source] std::io::Error),

    /// The resolver service could not be reactivated.
    #[error("could not reactivate {service}: {source}")]
    Restoration {
        /// Service that stays stopped.
        service: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// State-file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverrideError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::AddressNotFound { .. }
            | Self::InvalidConfig(_)
            | Self::UnsafeDirectory { .. }
            | Self::SignalSetup(_) => FailureKind::Preflight,
            Self::ConflictResolution { .. } | Self::Io(_) => FailureKind::ConflictResolution,
            Self::ConfigWrite { .. } | Self::Spawn { .. } | Self::StartupExit { .. } => {
                FailureKind::Launch
            }
            Self::UnexpectedExit { .. } | Self::Supervision(_) => FailureKind::Runtime,
            Self::Restoration { .. } => FailureKind::Restoration,
        }
    }

    /// Returns `true` if the underlying I/O error is `PermissionDenied`.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        let io = match self {
            Self::Io(e)
            | Self::SignalSetup(e)
            | Self::UnsafeDirectory { source: e, .. }
            | Self::ConflictResolution { source: e, .. }
            | Self::ConfigWrite { source: e, .. }
            | Self::Spawn { source: e, .. }
            | Self::Restoration { source: e, .. } => e,
            _ => return false,
        };
        io.kind() == std::io::ErrorKind::PermissionDenied
    }
}
