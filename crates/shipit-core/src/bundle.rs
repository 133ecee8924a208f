use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONTENTS_DIR: &str = "Contents";
pub const METADATA_FILE: &str = "Info.toml";
pub const EXECUTABLE_DIR: &str = "MacOS";

/// On-disk metadata stored at `Contents/Info.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleInfo {
    pub identifier: String,
    pub short_version: String,
    #[serde(default)]
    pub build_version: Option<String>,
    pub executable: String,
}

impl BundleInfo {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let info: Self = toml::from_str(input).context("failed to parse bundle metadata")?;
        if info.identifier.trim().is_empty() {
            return Err(anyhow!("bundle identifier must not be empty"));
        }
        if info.short_version.trim().is_empty() {
            return Err(anyhow!(
                "short_version must not be empty for bundle '{}'",
                info.identifier
            ));
        }
        if let Some(build) = &info.build_version {
            if build.trim().is_empty() {
                return Err(anyhow!(
                    "build_version must not be blank for bundle '{}'",
                    info.identifier
                ));
            }
        }
        validate_executable_name(&info.executable).with_context(|| {
            format!(
                "invalid executable '{}' for bundle '{}'",
                info.executable, info.identifier
            )
        })?;
        Ok(info)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize bundle metadata")
    }

    pub fn build_version(&self) -> &str {
        self.build_version.as_deref().unwrap_or(&self.short_version)
    }
}

/// Identity of an installed or staged bundle, derived read-only from its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleIdentity {
    pub bundle_identifier: String,
    pub short_version: String,
    pub build_version: String,
    pub executable_path: PathBuf,
}

impl BundleIdentity {
    /// Same identifier and same short/build version, regardless of where the
    /// bundle currently lives.
    pub fn same_release(&self, other: &BundleIdentity) -> bool {
        self.bundle_identifier == other.bundle_identifier
            && self.short_version == other.short_version
            && self.build_version == other.build_version
    }

    pub fn version_label(&self) -> String {
        if self.build_version == self.short_version {
            self.short_version.clone()
        } else {
            format!("{} ({})", self.short_version, self.build_version)
        }
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("not a bundle: {}: {reason}", .path.display())]
    NotABundle { path: PathBuf, reason: String },
    #[error("bundle metadata unavailable: {}: {reason}", .path.display())]
    MissingMetadata { path: PathBuf, reason: String },
}

pub fn contents_dir(bundle: &Path) -> PathBuf {
    bundle.join(CONTENTS_DIR)
}

pub fn metadata_path(bundle: &Path) -> PathBuf {
    contents_dir(bundle).join(METADATA_FILE)
}

pub fn executable_dir(bundle: &Path) -> PathBuf {
    contents_dir(bundle).join(EXECUTABLE_DIR)
}

pub fn read_bundle_info(bundle: &Path) -> Result<BundleInfo, BundleError> {
    let path = metadata_path(bundle);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(BundleError::MissingMetadata {
                path,
                reason: "metadata file not found".to_string(),
            });
        }
        Err(err) => {
            return Err(BundleError::MissingMetadata {
                path,
                reason: err.to_string(),
            });
        }
    };

    BundleInfo::from_toml_str(&raw).map_err(|err| BundleError::MissingMetadata {
        path,
        reason: format!("{err:#}"),
    })
}

/// Resolves the identity of the bundle rooted at `path`. Only reads.
pub fn resolve(path: &Path) -> Result<BundleIdentity, BundleError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return Err(BundleError::NotABundle {
                path: path.to_path_buf(),
                reason: err.to_string(),
            });
        }
    };
    if !metadata.is_dir() {
        return Err(BundleError::NotABundle {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    if !contents_dir(path).is_dir() {
        return Err(BundleError::NotABundle {
            path: path.to_path_buf(),
            reason: format!("missing {CONTENTS_DIR}/ directory"),
        });
    }

    let info = read_bundle_info(path)?;
    Ok(BundleIdentity {
        bundle_identifier: info.identifier.clone(),
        short_version: info.short_version.clone(),
        build_version: info.build_version().to_string(),
        executable_path: executable_dir(path).join(&info.executable),
    })
}

fn validate_executable_name(name: &str) -> anyhow::Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("executable name must not be empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!(
            "executable must be a single file name under {CONTENTS_DIR}/{EXECUTABLE_DIR}"
        )),
    }
}
