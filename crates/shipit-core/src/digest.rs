use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(unix)]
pub fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(metadata: &fs::Metadata) -> bool {
    metadata.is_file()
}

/// Deterministic fingerprint of a bundle tree: relative paths, file bytes,
/// executable bits and symlink targets all contribute.
pub fn bundle_digest(root: &Path) -> Result<String> {
    let mut entries = collect_entries(root)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (relative, kind) in entries {
        let full_path = root.join(&relative);
        hasher.update(normalize_relative_path(&relative).as_bytes());
        hasher.update([0]);
        match kind {
            EntryKind::Dir => hasher.update(b"d"),
            EntryKind::Symlink => {
                let target = fs::read_link(&full_path)
                    .with_context(|| format!("failed to read symlink {}", full_path.display()))?;
                hasher.update(b"l");
                hasher.update(target.to_string_lossy().as_bytes());
            }
            EntryKind::File { executable } => {
                hasher.update(if executable { b"x" } else { b"f" });
                let mut file = fs::File::open(&full_path)
                    .with_context(|| format!("failed to open {}", full_path.display()))?;
                let mut file_hasher = Sha256::new();
                io::copy(&mut file, &mut file_hasher)
                    .with_context(|| format!("failed to read {}", full_path.display()))?;
                hasher.update(file_hasher.finalize());
            }
        }
        hasher.update([0]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

enum EntryKind {
    Dir,
    Symlink,
    File { executable: bool },
}

fn collect_entries(root: &Path) -> Result<Vec<(PathBuf, EntryKind)>> {
    let mut entries = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed reading bundle directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .with_context(|| {
                    format!(
                        "failed deriving relative path {} from {}",
                        path.display(),
                        root.display()
                    )
                })?
                .to_path_buf();
            let metadata = fs::symlink_metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?;
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                entries.push((relative, EntryKind::Symlink));
            } else if file_type.is_dir() {
                entries.push((relative, EntryKind::Dir));
                queue.push_back(path);
            } else if file_type.is_file() {
                entries.push((
                    relative,
                    EntryKind::File {
                        executable: is_executable(&metadata),
                    },
                ));
            }
        }
    }

    Ok(entries)
}

fn normalize_relative_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
