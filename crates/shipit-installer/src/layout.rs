use anyhow::{anyhow, Context, Result};
use shipit_core::sha256_hex;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Private state owned by the installer: transaction records and lock files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn default_socket_path(&self) -> PathBuf {
        self.root.join("shipit.sock")
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.root.join("shipit.toml")
    }

    pub fn transaction_record_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn target_lock_path(&self, target: &Path) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", target_key(target)))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.transactions_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_dir() -> Result<PathBuf> {
    default_state_dir_with(|key| std::env::var_os(key))
}

/// `$SHIPIT_STATE_DIR`, else `$HOME/.shipit`, read through `lookup`.
pub fn default_state_dir_with<Lookup>(lookup: Lookup) -> Result<PathBuf>
where
    Lookup: Fn(&str) -> Option<OsString>,
{
    if let Some(dir) = lookup("SHIPIT_STATE_DIR").filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    let home = lookup("HOME").context("HOME is not set; cannot resolve state dir")?;
    Ok(PathBuf::from(home).join(".shipit"))
}

/// Stable short key for a target path, used to name its lock file.
pub fn target_key(target: &Path) -> String {
    let digest = sha256_hex(target.to_string_lossy().as_bytes());
    digest[..16].to_string()
}

/// Normalizes an absolute bundle path. Relative paths are rejected because the
/// requester's working directory is unknown to the installer, and `..` is
/// rejected because the kernel resolves it after symlinks, not lexically.
pub fn normalize_bundle_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(anyhow!("bundle path must be absolute: {}", path.display()));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(anyhow!(
                    "bundle path must not contain '..': {}",
                    path.display()
                ));
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.file_name().is_none() {
        return Err(anyhow!("bundle path has no final component: {}", path.display()));
    }
    Ok(normalized)
}

/// Sibling of `target` in the same directory, so renames between the two
/// never cross a volume boundary.
pub fn sibling_path(target: &Path, role: &str, txid: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    let parent = target.parent().unwrap_or_else(|| Path::new("/"));
    parent.join(format!(".{name}.shipit-{role}-{txid}"))
}

pub fn backup_path(target: &Path, txid: &str) -> PathBuf {
    sibling_path(target, "backup", txid)
}

pub fn scratch_path(target: &Path, txid: &str) -> PathBuf {
    sibling_path(target, "stage", txid)
}

pub fn discard_path(target: &Path, txid: &str) -> PathBuf {
    sibling_path(target, "discard", txid)
}
