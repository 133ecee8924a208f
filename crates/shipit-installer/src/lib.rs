mod error;
mod fs_utils;
mod layout;
mod locks;
mod relaunch;
mod staging;
mod swap;
mod transactions;
mod types;

pub use error::{ErrorClass, ErrorKind, InstallError};
pub use layout::{
    backup_path, default_state_dir, default_state_dir_with, discard_path, normalize_bundle_path,
    scratch_path, target_key, StateLayout,
};
pub use locks::{LeaseError, TargetLease, TargetLocks};
pub use relaunch::{
    finish_with_relaunch, launch_credentials, relaunch, LaunchCredentials, LaunchHandle,
};
pub use staging::{validate, ValidatedStage};
pub use swap::{sibling_paths, SwapEngine, SwapOptions};
pub use transactions::{
    clear_install_state, read_all_install_states, read_install_state, write_install_state,
};
pub use types::{
    CancelToken, InstallFailure, InstallPhase, InstallResult, InstallState, InstallStatus,
    RelaunchReport, RequesterIdentity, UpdateRequest, INSTALL_STATE_VERSION,
};
