//! Newline-delimited JSON messages exchanged over the installer socket.
//!
//! A client writes exactly one [`WireRequest`] line. The service answers with
//! zero or more `progress` lines and exactly one terminal `result` line, then
//! closes the connection.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use shipit_installer::{
    ErrorKind, InstallError, InstallPhase, InstallResult, InstallStatus, RelaunchReport,
    RequesterIdentity, UpdateRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireRequest {
    pub target_bundle_path: PathBuf,
    pub staged_update_path: PathBuf,
    pub should_relaunch: bool,
    /// Keep installing when the client goes away mid-request.
    #[serde(default)]
    pub survive_disconnect: bool,
}

impl WireRequest {
    /// Parses one request line. Every failure is a protocol error so that
    /// nothing malformed reaches the engine.
    pub fn decode(line: &str) -> Result<Self, InstallError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(InstallError::Protocol("empty request".to_string()));
        }
        let request: Self = serde_json::from_str(line)
            .map_err(|err| InstallError::Protocol(format!("invalid request: {err}")))?;
        if request.target_bundle_path.as_os_str().is_empty() {
            return Err(InstallError::Protocol(
                "target_bundle_path must not be empty".to_string(),
            ));
        }
        if request.staged_update_path.as_os_str().is_empty() {
            return Err(InstallError::Protocol(
                "staged_update_path must not be empty".to_string(),
            ));
        }
        Ok(request)
    }

    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed to encode request")?;
        line.push('\n');
        Ok(line)
    }

    /// Binds the request to credentials taken from the transport.
    pub fn into_update_request(self, requester_identity: RequesterIdentity) -> UpdateRequest {
        UpdateRequest {
            target_bundle_path: self.target_bundle_path,
            staged_update_path: self.staged_update_path,
            should_relaunch: self.should_relaunch,
            requester_identity,
            survive_disconnect: self.survive_disconnect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Progress { phase: InstallPhase },
    Result(ResultMessage),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed to encode server message")?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .with_context(|| format!("invalid message from installer service: {line}"))
    }
}

/// Terminal outcome as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    pub status: InstallStatus,
    /// Empty when the request never named a usable path.
    pub final_bundle_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relaunch: Option<RelaunchReport>,
}

impl ResultMessage {
    /// Result for a request rejected before it reached the engine.
    pub fn rejected(final_bundle_path: PathBuf, err: &InstallError) -> Self {
        Self::from(&InstallResult::failed(None, final_bundle_path, err))
    }
}

impl From<&InstallResult> for ResultMessage {
    fn from(result: &InstallResult) -> Self {
        Self {
            txid: result.txid.clone(),
            status: result.status,
            final_bundle_path: result.final_bundle_path.display().to_string(),
            error_kind: result.error_kind(),
            error_detail: result.error.as_ref().map(|failure| failure.message.clone()),
            backup_path: result
                .backup_path
                .as_ref()
                .map(|path| path.display().to_string()),
            relaunch: result.relaunch.clone(),
        }
    }
}
