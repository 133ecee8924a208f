use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs_utils::{remove_file_if_exists, sync_dir, write_atomic};
use crate::{InstallState, StateLayout, INSTALL_STATE_VERSION};

static TXID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn new_txid() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    Ok(format!(
        "tx-{}-{}-{:04}",
        nanos,
        std::process::id(),
        TXID_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000
    ))
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// Durably persists `state`; replaces any earlier record for the same txid.
pub fn write_install_state(layout: &StateLayout, state: &InstallState) -> Result<PathBuf> {
    let path = layout.transaction_record_path(&state.txid);
    let payload =
        serde_json::to_vec_pretty(state).context("failed to serialize transaction record")?;
    write_atomic(&path, &payload)
        .with_context(|| format!("failed to write transaction record: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_state(layout: &StateLayout, txid: &str) -> Result<Option<InstallState>> {
    read_install_state_at(&layout.transaction_record_path(txid))
}

fn read_install_state_at(path: &Path) -> Result<Option<InstallState>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read transaction record: {}", path.display())
            });
        }
    };

    let state: InstallState = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing transaction record: {}", path.display()))?;
    if state.version != INSTALL_STATE_VERSION {
        return Err(anyhow!(
            "unsupported transaction record version {} in {}",
            state.version,
            path.display()
        ));
    }
    Ok(Some(state))
}

/// All persisted records, oldest first.
pub fn read_all_install_states(layout: &StateLayout) -> Result<Vec<InstallState>> {
    let dir = layout.transactions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut states = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read transaction directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        if let Some(state) = read_install_state_at(&path)? {
            states.push(state);
        }
    }

    states.sort_by(|a, b| {
        a.started_at_unix
            .cmp(&b.started_at_unix)
            .then_with(|| a.txid.cmp(&b.txid))
    });
    Ok(states)
}

pub fn clear_install_state(layout: &StateLayout, txid: &str) -> Result<()> {
    let path = layout.transaction_record_path(txid);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to clear transaction record: {}", path.display()))?;
    sync_dir(&layout.transactions_dir())
}
