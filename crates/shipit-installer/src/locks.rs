use anyhow::{anyhow, Context};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::StateLayout;

/// Why a lease could not be taken.
#[derive(Debug)]
pub enum LeaseError {
    Busy { holder: Option<String> },
    Io(anyhow::Error),
}

/// In-process registry of targets with an install in flight.
#[derive(Debug, Clone, Default)]
pub struct TargetLocks {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, target: &Path) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(target))
            .unwrap_or(false)
    }

    /// Claims `target` in this process and on disk. Never waits: a held lock is
    /// reported as `Busy` straight away.
    pub fn acquire(
        &self,
        layout: &StateLayout,
        target: &Path,
        txid: &str,
    ) -> Result<TargetLease, LeaseError> {
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| LeaseError::Io(anyhow!("target lock registry is poisoned")))?;
            if !active.insert(target.to_path_buf()) {
                return Err(LeaseError::Busy { holder: None });
            }
        }

        let lock_path = layout.target_lock_path(target);
        match claim_lock_file(&lock_path, target, txid) {
            Ok(file_lock) => Ok(TargetLease {
                locks: self.clone(),
                target: target.to_path_buf(),
                _file_lock: file_lock,
            }),
            Err(err) => {
                self.release_in_process(target);
                Err(err)
            }
        }
    }

    fn release_in_process(&self, target: &Path) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(target);
        }
    }
}

/// Exclusive ownership of one target path. Released on drop.
///
/// The on-disk half is an advisory `flock` on a per-target lock file. The
/// kernel drops it when the holder exits, so a crashed installer never leaves
/// a lock that needs reclaiming, and lock files are never unlinked.
#[derive(Debug)]
pub struct TargetLease {
    locks: TargetLocks,
    target: PathBuf,
    _file_lock: Flock<File>,
}

impl TargetLease {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.locks.release_in_process(&self.target);
    }
}

fn claim_lock_file(
    lock_path: &Path,
    target: &Path,
    txid: &str,
) -> Result<Flock<File>, LeaseError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .map_err(LeaseError::Io)?;
    }

    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("failed to open lock file: {}", lock_path.display()))
        .map_err(LeaseError::Io)?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, Errno::EWOULDBLOCK)) => {
            let holder = read_lock_holder(lock_path);
            debug!(lock = %lock_path.display(), holder = ?holder, "target lock is held");
            return Err(LeaseError::Busy { holder });
        }
        Err((_, errno)) => {
            return Err(LeaseError::Io(anyhow::Error::new(errno).context(format!(
                "failed to lock {}",
                lock_path.display()
            ))));
        }
    };

    // Holder details are informational only; the flock is what excludes.
    let payload = format!(
        "pid={}\ntxid={}\ntarget={}\n",
        std::process::id(),
        txid,
        target.display()
    );
    let mut handle: &File = &lock;
    let written = handle
        .set_len(0)
        .and_then(|_| handle.write_all(payload.as_bytes()))
        .and_then(|_| handle.flush());
    if let Err(err) = written {
        warn!(lock = %lock_path.display(), error = %err, "failed to record lock holder");
    }
    Ok(lock)
}

fn read_lock_holder(lock_path: &Path) -> Option<String> {
    let raw = fs::read_to_string(lock_path).ok()?;
    raw.lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(key, _)| *key == "txid")
        .map(|(_, value)| value.to_string())
}
