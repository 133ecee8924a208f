use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use shipit_core::BundleError;
use thiserror::Error;

use crate::InstallPhase;

/// Stable, wire-visible name of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotABundle,
    MissingMetadata,
    CorruptBundle,
    MissingExecutable,
    IdentityMismatch,
    Unauthorized,
    Cancelled,
    TransientIo,
    VerificationFailed,
    RollbackFailure,
    ProtocolError,
    Busy,
    LaunchDenied,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotABundle => "NotABundle",
            Self::MissingMetadata => "MissingMetadata",
            Self::CorruptBundle => "CorruptBundle",
            Self::MissingExecutable => "MissingExecutable",
            Self::IdentityMismatch => "IdentityMismatch",
            Self::Unauthorized => "Unauthorized",
            Self::Cancelled => "Cancelled",
            Self::TransientIo => "TransientIo",
            Self::VerificationFailed => "VerificationFailed",
            Self::RollbackFailure => "RollbackFailure",
            Self::ProtocolError => "ProtocolError",
            Self::Busy => "Busy",
            Self::LaunchDenied => "LaunchDenied",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::NotABundle,
            Self::MissingMetadata,
            Self::CorruptBundle,
            Self::MissingExecutable,
            Self::IdentityMismatch,
            Self::Unauthorized,
            Self::Cancelled,
            Self::TransientIo,
            Self::VerificationFailed,
            Self::RollbackFailure,
            Self::ProtocolError,
            Self::Busy,
            Self::LaunchDenied,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotABundle
            | Self::MissingMetadata
            | Self::CorruptBundle
            | Self::MissingExecutable
            | Self::IdentityMismatch
            | Self::Unauthorized
            | Self::Cancelled => ErrorClass::PreconditionFailure,
            Self::TransientIo | Self::VerificationFailed => ErrorClass::TransientIoFailure,
            Self::RollbackFailure => ErrorClass::RollbackFailure,
            Self::ProtocolError => ErrorClass::ProtocolError,
            Self::Busy => ErrorClass::Busy,
            Self::LaunchDenied => ErrorClass::LaunchFailure,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing on disk was mutated.
    PreconditionFailure,
    /// A move failed mid-install; the engine rolls back.
    TransientIoFailure,
    /// Restoring the backup failed; needs an operator.
    RollbackFailure,
    ProtocolError,
    /// Another install owns the target; retry later.
    Busy,
    LaunchFailure,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("staged bundle is corrupt: {0}")]
    CorruptBundle(String),
    #[error("staged bundle executable is not runnable: {0}")]
    MissingExecutable(String),
    #[error("bundle identifier mismatch: installed '{installed}', staged '{staged}'")]
    IdentityMismatch { installed: String, staged: String },
    #[error("caller is not authorized to update {0}")]
    Unauthorized(String),
    #[error("install cancelled by the client")]
    Cancelled,
    #[error("{phase} failed: {detail}")]
    TransientIo { phase: InstallPhase, detail: String },
    #[error("installed bundle failed verification: {0}")]
    VerificationFailed(String),
    #[error("rollback failed, original bundle left at {}: {detail}", .backup.display())]
    RollbackFailure { backup: PathBuf, detail: String },
    #[error("malformed request: {0}")]
    Protocol(String),
    #[error("an install is already running for {}", .0.display())]
    Busy(PathBuf),
    #[error("relaunch denied: {0}")]
    LaunchDenied(String),
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bundle(BundleError::NotABundle { .. }) => ErrorKind::NotABundle,
            Self::Bundle(BundleError::MissingMetadata { .. }) => ErrorKind::MissingMetadata,
            Self::CorruptBundle(_) => ErrorKind::CorruptBundle,
            Self::MissingExecutable(_) => ErrorKind::MissingExecutable,
            Self::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::VerificationFailed(_) => ErrorKind::VerificationFailed,
            Self::RollbackFailure { .. } => ErrorKind::RollbackFailure,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::Busy(_) => ErrorKind::Busy,
            Self::LaunchDenied(_) => ErrorKind::LaunchDenied,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    /// Classifies an internal filesystem failure at the phase it happened in.
    pub(crate) fn io(phase: InstallPhase, err: anyhow::Error) -> Self {
        Self::TransientIo {
            phase,
            detail: format!("{err:#}"),
        }
    }
}
