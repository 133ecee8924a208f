use anyhow::{anyhow, Context, Result};
use shipit_core::{bundle_digest, is_executable, resolve, BundleIdentity};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::fs_utils::{
    copy_dir_recursive, is_cross_device, path_present, remove_dir_if_exists, rename_durable,
};
use crate::InstallError;

/// A staged bundle that passed validation. Holding one proves nothing on disk
/// was touched to obtain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStage {
    pub path: PathBuf,
    pub identity: BundleIdentity,
    pub digest: String,
}

/// Read-only structural gate for a staged update.
pub fn validate(staged_path: &Path) -> Result<ValidatedStage, InstallError> {
    let identity = resolve(staged_path)?;

    let executable = &identity.executable_path;
    let metadata = fs::metadata(executable).map_err(|err| {
        InstallError::CorruptBundle(format!(
            "declared executable {} is unavailable: {err}",
            executable.display()
        ))
    })?;
    if !metadata.is_file() {
        return Err(InstallError::CorruptBundle(format!(
            "declared executable {} is not a regular file",
            executable.display()
        )));
    }
    if !is_executable(&metadata) {
        return Err(InstallError::MissingExecutable(format!(
            "{} is not marked executable",
            executable.display()
        )));
    }

    let digest = bundle_digest(staged_path).map_err(|err| {
        InstallError::CorruptBundle(format!(
            "failed to read staged tree {}: {err:#}",
            staged_path.display()
        ))
    })?;

    debug!(
        staged = %staged_path.display(),
        identifier = %identity.bundle_identifier,
        version = %identity.version_label(),
        "staged bundle validated"
    );
    Ok(ValidatedStage {
        path: staged_path.to_path_buf(),
        identity,
        digest,
    })
}

/// Places the validated stage at `scratch`, a sibling of the install target.
/// A plain rename is used when both live on one volume; otherwise the tree
/// is copied and the copy must reproduce the validated digest.
pub fn prepare_scratch(stage: &ValidatedStage, scratch: &Path) -> Result<()> {
    if let Some(parent) = scratch.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create scratch parent: {}", parent.display()))?;
    }

    match fs::rename(&stage.path, scratch) {
        Ok(()) => {
            debug!(scratch = %scratch.display(), "stage moved into scratch");
            return Ok(());
        }
        Err(err) if is_cross_device(&err) => {
            info!(
                staged = %stage.path.display(),
                scratch = %scratch.display(),
                "stage is on another volume; copying into scratch"
            );
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to move stage {} to {}",
                    stage.path.display(),
                    scratch.display()
                )
            });
        }
    }

    let copied = copy_dir_recursive(&stage.path, scratch).and_then(|_| {
        let digest = bundle_digest(scratch)?;
        if digest != stage.digest {
            return Err(anyhow!(
                "scratch copy digest {digest} does not match staged digest {}",
                stage.digest
            ));
        }
        Ok(())
    });
    if let Err(err) = copied {
        let _ = remove_dir_if_exists(scratch);
        return Err(err);
    }

    remove_dir_if_exists(&stage.path)
        .with_context(|| format!("failed to cleanup staged bundle: {}", stage.path.display()))?;
    Ok(())
}

/// Moves an unused scratch tree back to where the client staged it, or drops
/// it when that location has been reused.
pub fn return_scratch(staged_path: &Path, scratch: &Path) -> Result<()> {
    if !path_present(scratch) {
        return Ok(());
    }
    if !path_present(staged_path) && rename_durable(scratch, staged_path).is_ok() {
        debug!(staged = %staged_path.display(), "returned unused stage");
        return Ok(());
    }
    remove_dir_if_exists(scratch)
        .with_context(|| format!("failed to remove scratch: {}", scratch.display()))
}
