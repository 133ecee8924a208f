use std::fs;
use std::path::{Path, PathBuf};

use shipit_core::BundleError;
use shipit_installer::{normalize_bundle_path, InstallError, RequesterIdentity};

/// Resolves a requested bundle path once, so the path that is authorized is
/// the path that is installed. The parent directory is canonicalized; the
/// final component is kept as given so a bundle that is itself a symlink is
/// judged by the link.
pub fn resolve_request_path(path: &Path) -> Result<PathBuf, InstallError> {
    let not_a_bundle = |reason: String| {
        InstallError::Bundle(BundleError::NotABundle {
            path: path.to_path_buf(),
            reason,
        })
    };

    let normalized =
        normalize_bundle_path(path).map_err(|err| not_a_bundle(format!("{err:#}")))?;
    let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) else {
        return Err(not_a_bundle("bundle path has no parent directory".to_string()));
    };
    let parent = fs::canonicalize(parent)
        .map_err(|err| not_a_bundle(format!("cannot resolve {}: {err}", parent.display())))?;
    Ok(parent.join(name))
}

/// A peer may replace a bundle when it is root or runs as the service itself.
/// Anyone else must own both the installed bundle (its parent directory when
/// the bundle does not exist yet) and the staged update that will be
/// consumed.
pub fn authorize(
    peer: &RequesterIdentity,
    target: &Path,
    staged: &Path,
    service_uid: u32,
) -> Result<(), InstallError> {
    if peer.uid == 0 || peer.uid == service_uid {
        return Ok(());
    }

    require_owner(peer, target, owner_uid(target, true))?;
    require_owner(peer, staged, owner_uid(staged, false))
}

fn require_owner(
    peer: &RequesterIdentity,
    path: &Path,
    owner: Option<u32>,
) -> Result<(), InstallError> {
    match owner {
        Some(owner) if owner == peer.uid => Ok(()),
        Some(owner) => Err(InstallError::Unauthorized(format!(
            "{} is owned by uid {owner}, caller is uid {}",
            path.display(),
            peer.uid
        ))),
        None => Err(InstallError::Unauthorized(format!(
            "cannot determine owner of {}",
            path.display()
        ))),
    }
}

fn owner_uid(path: &Path, parent_if_missing: bool) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;

    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(_) if parent_if_missing => fs::metadata(path.parent()?).ok()?,
        Err(_) => return None,
    };
    Some(metadata.uid())
}
