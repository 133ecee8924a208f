mod bundle;
mod digest;

pub use bundle::{
    contents_dir, executable_dir, metadata_path, read_bundle_info, resolve, BundleError,
    BundleIdentity, BundleInfo, CONTENTS_DIR, EXECUTABLE_DIR, METADATA_FILE,
};
pub use digest::{bundle_digest, is_executable, sha256_hex};

#[cfg(test)]
mod tests;
