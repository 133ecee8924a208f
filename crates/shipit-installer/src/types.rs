use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shipit_core::BundleIdentity;

use crate::error::{ErrorKind, InstallError};

/// Credentials of the process that submitted a request, taken from the
/// transport rather than from the request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub target_bundle_path: PathBuf,
    pub staged_update_path: PathBuf,
    pub should_relaunch: bool,
    pub requester_identity: RequesterIdentity,
    pub survive_disconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Idle,
    BackingUp,
    Installing,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl InstallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing_up",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Success,
    RolledBack,
    Failed,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&InstallError> for InstallFailure {
    fn from(err: &InstallError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaunchReport {
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// Terminal outcome of one request. Emitted once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub txid: Option<String>,
    pub status: InstallStatus,
    pub final_bundle_path: PathBuf,
    pub error: Option<InstallFailure>,
    /// Backup directory still on disk: the orphaned original after a failed
    /// rollback, or a leaked backup after a commit.
    pub backup_path: Option<PathBuf>,
    pub relaunch: Option<RelaunchReport>,
}

impl InstallResult {
    pub fn success(txid: Option<String>, final_bundle_path: PathBuf) -> Self {
        Self {
            txid,
            status: InstallStatus::Success,
            final_bundle_path,
            error: None,
            backup_path: None,
            relaunch: None,
        }
    }

    pub fn rolled_back(
        txid: Option<String>,
        final_bundle_path: PathBuf,
        cause: Option<&InstallError>,
    ) -> Self {
        Self {
            txid,
            status: InstallStatus::RolledBack,
            final_bundle_path,
            error: cause.map(InstallFailure::from),
            backup_path: None,
            relaunch: None,
        }
    }

    pub fn failed(txid: Option<String>, final_bundle_path: PathBuf, err: &InstallError) -> Self {
        let backup_path = match err {
            InstallError::RollbackFailure { backup, .. } => Some(backup.clone()),
            _ => None,
        };
        Self {
            txid,
            status: InstallStatus::Failed,
            final_bundle_path,
            error: Some(InstallFailure::from(err)),
            backup_path,
            relaunch: None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|failure| failure.kind)
    }
}

/// The engine's record for one install. Persisted to the transaction journal
/// at every phase transition so recovery can rebuild it from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    pub version: u32,
    pub txid: String,
    pub current_phase: InstallPhase,
    pub target_path: PathBuf,
    pub staged_path: PathBuf,
    pub scratch_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub expected_identity: BundleIdentity,
    pub expected_digest: Option<String>,
    pub last_error: Option<String>,
    pub started_at_unix: u64,
}

pub const INSTALL_STATE_VERSION: u32 = 1;

/// Shared cancellation flag checked by the engine at phase boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
