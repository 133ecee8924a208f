use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use shipit_core::resolve;
use tracing::{info, warn};

use crate::{InstallError, InstallResult, InstallStatus, RelaunchReport, RequesterIdentity};

/// Credentials the relaunched application is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchCredentials {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHandle {
    pub pid: u32,
    pub executable: PathBuf,
    /// `None` when the application runs with the installer's own credentials.
    pub run_as: Option<LaunchCredentials>,
}

/// Credentials to drop to before starting an application for `requester`.
/// Only root and the installer's own user keep the installer's credentials.
pub fn launch_credentials(
    requester: &RequesterIdentity,
    service_uid: u32,
) -> Option<LaunchCredentials> {
    if requester.uid == 0 || requester.uid == service_uid {
        return None;
    }
    Some(LaunchCredentials {
        uid: requester.uid,
        gid: requester.gid,
    })
}

/// Starts whatever bundle now lives at `bundle_path`, as `requester`.
pub fn relaunch(
    bundle_path: &Path,
    should_relaunch: bool,
    requester: &RequesterIdentity,
) -> Result<Option<LaunchHandle>, InstallError> {
    let run_as = launch_credentials(requester, current_uid());
    relaunch_with_spawner(bundle_path, should_relaunch, run_as, |command| {
        let mut child = command.spawn()?;
        let pid = child.id();
        // Reap in the background so a resident installer never collects zombies.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    })
}

pub(crate) fn relaunch_with_spawner<Spawn>(
    bundle_path: &Path,
    should_relaunch: bool,
    run_as: Option<LaunchCredentials>,
    spawn: Spawn,
) -> Result<Option<LaunchHandle>, InstallError>
where
    Spawn: FnOnce(&mut Command) -> io::Result<u32>,
{
    if !should_relaunch {
        return Ok(None);
    }

    let identity = resolve(bundle_path).map_err(|err| {
        InstallError::LaunchDenied(format!("cannot resolve bundle to launch: {err}"))
    })?;
    let version = identity.version_label();
    let executable = identity.executable_path;
    ensure_inside_bundle(bundle_path, &executable)?;

    let mut command = Command::new(&executable);
    command
        .current_dir(bundle_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(credentials) = run_as {
        // std clears supplementary groups when a root parent sets a uid.
        use std::os::unix::process::CommandExt;
        command.uid(credentials.uid).gid(credentials.gid);
    }

    let pid = spawn(&mut command).map_err(|err| {
        InstallError::LaunchDenied(format!("failed to start {}: {err}", executable.display()))
    })?;

    info!(
        pid,
        executable = %executable.display(),
        version = %version,
        uid = run_as.map(|credentials| credentials.uid),
        "relaunched application"
    );
    Ok(Some(LaunchHandle {
        pid,
        executable,
        run_as,
    }))
}

/// The executable must resolve to a file inside the bundle, so a symlink
/// cannot point the relaunch at an arbitrary program.
fn ensure_inside_bundle(bundle_path: &Path, executable: &Path) -> Result<(), InstallError> {
    let bundle = fs::canonicalize(bundle_path).map_err(|err| {
        InstallError::LaunchDenied(format!("cannot resolve {}: {err}", bundle_path.display()))
    })?;
    let resolved = fs::canonicalize(executable).map_err(|err| {
        InstallError::LaunchDenied(format!("cannot resolve {}: {err}", executable.display()))
    })?;
    if !resolved.starts_with(&bundle) {
        return Err(InstallError::LaunchDenied(format!(
            "{} resolves outside the bundle to {}",
            executable.display(),
            resolved.display()
        )));
    }
    Ok(())
}

fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// Runs the relaunch step for a terminal result and records its outcome
/// without touching the install status.
pub fn finish_with_relaunch(
    result: InstallResult,
    should_relaunch: bool,
    requester: &RequesterIdentity,
) -> InstallResult {
    finish_with_spawner(result, should_relaunch, |bundle| {
        relaunch(bundle, true, requester)
    })
}

pub(crate) fn finish_with_spawner<Launch>(
    mut result: InstallResult,
    should_relaunch: bool,
    launch: Launch,
) -> InstallResult
where
    Launch: FnOnce(&Path) -> Result<Option<LaunchHandle>, InstallError>,
{
    if !should_relaunch || result.final_bundle_path.as_os_str().is_empty() {
        return result;
    }
    // The install that owns the target relaunches it when it finishes.
    if result.status == InstallStatus::Failed
        && result
            .error_kind()
            .is_some_and(|kind| kind.class() == crate::ErrorClass::Busy)
    {
        return result;
    }

    result.relaunch = Some(match launch(&result.final_bundle_path) {
        Ok(handle) => RelaunchReport {
            pid: handle.map(|handle| handle.pid),
            error: None,
        },
        Err(err) => {
            warn!(
                bundle = %result.final_bundle_path.display(),
                error = %err,
                "relaunch failed"
            );
            RelaunchReport {
                pid: None,
                error: Some(err.to_string()),
            }
        }
    });
    result
}
