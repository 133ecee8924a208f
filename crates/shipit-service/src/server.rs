use anyhow::{anyhow, Context, Result};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use shipit_installer::{
    finish_with_relaunch, CancelToken, InstallError, InstallPhase, InstallResult, InstallState,
    RequesterIdentity, SwapEngine,
};

use crate::auth::{authorize, resolve_request_path};
use crate::config::ServiceConfig;
use crate::protocol::{ResultMessage, ServerMessage, WireRequest};

/// Runs on the install thread after each phase is journaled.
pub(crate) type InstallHook =
    Arc<dyn Fn(InstallPhase, &InstallState) -> Result<()> + Send + Sync>;

/// The resident installer: owns the swap engine and answers socket clients.
pub struct InstallerService {
    engine: Arc<SwapEngine>,
    config: ServiceConfig,
    socket_path: PathBuf,
    service_uid: u32,
    install_hook: Option<InstallHook>,
}

impl InstallerService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let engine = SwapEngine::new(config.layout()?, config.swap_options())?;
        let socket_path = config.socket_path()?;
        Ok(Self {
            engine: Arc::new(engine),
            config,
            socket_path,
            service_uid: current_uid(),
            install_hook: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_install_hook(mut self, hook: InstallHook) -> Self {
        self.install_hook = Some(hook);
        self
    }

    pub fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Settles installs interrupted by a previous run. Call before serving.
    pub fn recover_pending(&self) -> Result<Vec<InstallResult>> {
        let results = self.engine.recover()?;
        for result in &results {
            info!(
                txid = result.txid.as_deref().unwrap_or("-"),
                target = %result.final_bundle_path.display(),
                status = result.status.as_str(),
                "recovered interrupted install"
            );
        }
        Ok(results)
    }

    pub fn bind(&self) -> Result<UnixListener> {
        let path = &self.socket_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create socket directory: {}", parent.display())
            })?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind installer socket: {}", path.display()))?;

        // Any local user may connect; each request is authorized by peer uid.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o666)).with_context(|| {
                format!("failed to set socket permissions: {}", path.display())
            })?;
        }

        info!(socket = %path.display(), "installer service listening");
        Ok(listener)
    }

    /// Accepts clients until `shutdown` resolves, then waits for in-flight
    /// installs and removes the socket file.
    pub async fn serve<Shutdown>(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: Shutdown,
    ) -> Result<()>
    where
        Shutdown: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&self);
                        connections.spawn(async move {
                            if let Err(err) = service.handle_connection(stream).await {
                                error!(error = %format!("{err:#}"), "connection handler error");
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "failed to accept connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "connection task failed");
                    }
                }
            }
        }

        info!(in_flight = connections.len(), "shutting down installer service");
        while connections.join_next().await.is_some() {}
        drop(listener);
        if let Err(err) = fs::remove_file(&self.socket_path) {
            warn!(socket = %self.socket_path.display(), error = %err, "failed to remove socket");
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let credentials = stream.peer_cred().context("failed to read peer credentials")?;
        let requester = RequesterIdentity {
            uid: credentials.uid(),
            gid: credentials.gid(),
            pid: credentials.pid(),
        };
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request = match tokio::time::timeout(
            self.config.request_timeout(),
            read_request_line(&mut reader, self.config.max_request_bytes),
        )
        .await
        {
            Ok(Ok(line)) => WireRequest::decode(&line),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(InstallError::Protocol(
                "timed out waiting for a request".to_string(),
            )),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!(peer_uid = requester.uid, error = %err, "rejecting malformed request");
                let result = ResultMessage::rejected(PathBuf::new(), &err);
                return send_result(&mut writer, result).await;
            }
        };

        let request = match resolve_paths(request) {
            Ok(request) => request,
            Err((target, err)) => {
                warn!(
                    peer_uid = requester.uid,
                    target = %target.display(),
                    error = %err,
                    "rejecting request with unusable paths"
                );
                let result = ResultMessage::rejected(target, &err);
                return send_result(&mut writer, result).await;
            }
        };

        if let Err(err) = authorize(
            &requester,
            &request.target_bundle_path,
            &request.staged_update_path,
            self.service_uid,
        ) {
            warn!(
                peer_uid = requester.uid,
                target = %request.target_bundle_path.display(),
                error = %err,
                "rejecting unauthorized request"
            );
            let result = ResultMessage::rejected(request.target_bundle_path.clone(), &err);
            return send_result(&mut writer, result).await;
        }

        let result = self.run_install(request, requester, &mut reader, &mut writer).await;
        match result {
            Some(result) => send_result(&mut writer, ResultMessage::from(&result)).await,
            None => Ok(()),
        }
    }

    /// Runs the install off the async workers while streaming its phases.
    /// Returns `None` when the client is gone and nothing can be delivered.
    async fn run_install(
        &self,
        request: WireRequest,
        requester: RequesterIdentity,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Option<InstallResult> {
        let target = request.target_bundle_path.clone();
        let survive_disconnect = request.survive_disconnect;
        let update = request.into_update_request(requester);
        let should_relaunch = update.should_relaunch;

        let cancel = CancelToken::new();
        let (phase_tx, mut phase_rx) = mpsc::unbounded_channel::<InstallPhase>();
        let engine = Arc::clone(&self.engine);
        let hook = self.install_hook.clone();
        let job_cancel = cancel.clone();
        let mut job = tokio::task::spawn_blocking(move || {
            let result = engine.install_with_hooks(
                &update,
                &job_cancel,
                &mut |phase: InstallPhase| {
                    let _ = phase_tx.send(phase);
                },
                &mut |phase: InstallPhase, state: &InstallState| match &hook {
                    Some(hook) => hook(phase, state),
                    None => Ok(()),
                },
            );
            finish_with_relaunch(result, should_relaunch, &requester)
        });

        let mut client_gone = false;
        let mut phases_open = true;
        let mut unread = [0u8; 64];
        let joined = loop {
            tokio::select! {
                joined = &mut job => break joined,
                phase = phase_rx.recv(), if phases_open => match phase {
                    Some(phase) if !client_gone => {
                        if send_message(writer, &ServerMessage::Progress { phase }).await.is_err() {
                            client_gone = true;
                            on_disconnect(&target, survive_disconnect, &cancel);
                        }
                    }
                    Some(_) => {}
                    None => phases_open = false,
                },
                read = reader.read(&mut unread), if !client_gone => match read {
                    Ok(0) | Err(_) => {
                        client_gone = true;
                        on_disconnect(&target, survive_disconnect, &cancel);
                    }
                    Ok(_) => debug!("ignoring bytes sent after the request"),
                },
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(err) => {
                error!(target = %target.display(), error = %err, "install task failed");
                let err = InstallError::TransientIo {
                    phase: InstallPhase::Idle,
                    detail: format!("install task failed: {err}"),
                };
                InstallResult::failed(None, target.clone(), &err)
            }
        };
        info!(
            txid = result.txid.as_deref().unwrap_or("-"),
            target = %target.display(),
            status = result.status.as_str(),
            error_kind = result.error_kind().map(|kind| kind.as_str()).unwrap_or("-"),
            "install request finished"
        );

        if client_gone {
            return None;
        }
        while let Ok(phase) = phase_rx.try_recv() {
            if send_message(writer, &ServerMessage::Progress { phase }).await.is_err() {
                return None;
            }
        }
        Some(result)
    }
}

/// Both paths are resolved before authorization so the checked path is the
/// installed one. The error carries the path to report back.
fn resolve_paths(request: WireRequest) -> Result<WireRequest, (PathBuf, InstallError)> {
    let target_bundle_path = resolve_request_path(&request.target_bundle_path)
        .map_err(|err| (request.target_bundle_path.clone(), err))?;
    let staged_update_path = resolve_request_path(&request.staged_update_path)
        .map_err(|err| (request.target_bundle_path.clone(), err))?;
    Ok(WireRequest {
        target_bundle_path,
        staged_update_path,
        ..request
    })
}

fn on_disconnect(target: &Path, survive_disconnect: bool, cancel: &CancelToken) {
    if survive_disconnect {
        info!(target = %target.display(), "client disconnected; install continues");
    } else {
        info!(target = %target.display(), "client disconnected; cancelling install");
        cancel.cancel();
    }
}

async fn read_request_line(
    reader: &mut BufReader<OwnedReadHalf>,
    max_bytes: usize,
) -> Result<String, InstallError> {
    let mut line = String::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader)
        .take(limit)
        .read_line(&mut line)
        .await
        .map_err(|err| InstallError::Protocol(format!("failed to read request: {err}")))?;
    if read == 0 {
        return Err(InstallError::Protocol(
            "connection closed before a request was sent".to_string(),
        ));
    }
    if line.len() > max_bytes {
        return Err(InstallError::Protocol(format!(
            "request exceeds {max_bytes} bytes"
        )));
    }
    Ok(line)
}

async fn send_message(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> Result<()> {
    let line = message.encode()?;
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to write to client")?;
    writer.flush().await.context("failed to flush client stream")
}

async fn send_result(writer: &mut OwnedWriteHalf, result: ResultMessage) -> Result<()> {
    send_message(writer, &ServerMessage::Result(result)).await?;
    writer.shutdown().await.context("failed to close client stream")
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(anyhow!(
                "refusing to replace non-socket file at {}",
                path.display()
            ));
        }
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(anyhow!(
                "another installer service is already listening on {}",
                path.display()
            ));
        }
    }

    debug!(socket = %path.display(), "removing stale socket");
    fs::remove_file(path)
        .with_context(|| format!("failed to remove stale socket: {}", path.display()))
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
