use anyhow::{anyhow, Context, Result};
use shipit_core::{bundle_digest, resolve, BundleError};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::fs_utils::{path_present, remove_any_if_exists, remove_dir_if_exists, rename_durable};
use crate::layout::{backup_path, discard_path, normalize_bundle_path, scratch_path};
use crate::locks::{LeaseError, TargetLocks};
use crate::staging::{prepare_scratch, return_scratch, validate};
use crate::transactions::{
    clear_install_state, current_unix_timestamp, new_txid, read_all_install_states,
    read_install_state, write_install_state,
};
use crate::{
    CancelToken, InstallError, InstallPhase, InstallResult, InstallState, StateLayout,
    UpdateRequest, INSTALL_STATE_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapOptions {
    /// Also compare the installed tree's content digest with the staged one
    /// during verification and recovery.
    pub verify_digest: bool,
}

impl Default for SwapOptions {
    fn default() -> Self {
        Self {
            verify_digest: true,
        }
    }
}

type Observer<'a> = &'a mut dyn FnMut(InstallPhase);
type Hook<'a> = &'a mut dyn FnMut(InstallPhase, &InstallState) -> Result<()>;

/// Replaces installed bundles through a crash-recoverable state machine.
///
/// Every mutation is a same-volume rename between the target and one of its
/// siblings (scratch, backup, discard), and each phase is journaled before it
/// starts, so the filesystem alone tells recovery how far an install got.
#[derive(Debug)]
pub struct SwapEngine {
    layout: StateLayout,
    locks: TargetLocks,
    options: SwapOptions,
}

impl SwapEngine {
    pub fn new(layout: StateLayout, options: SwapOptions) -> Result<Self> {
        layout.ensure_base_dirs()?;
        Ok(Self {
            layout,
            locks: TargetLocks::new(),
            options,
        })
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn options(&self) -> SwapOptions {
        self.options
    }

    pub fn is_target_busy(&self, target: &Path) -> bool {
        normalize_bundle_path(target)
            .map(|target| self.locks.is_locked(&target))
            .unwrap_or(false)
    }

    pub fn install<Observe>(
        &self,
        request: &UpdateRequest,
        cancel: &CancelToken,
        mut observe: Observe,
    ) -> InstallResult
    where
        Observe: FnMut(InstallPhase),
    {
        self.install_with_hooks(request, cancel, &mut observe, &mut |_, _| Ok(()))
    }

    /// Like [`SwapEngine::install`], with `hook` invoked right after each phase
    /// is entered and journaled. A hook error is handled like a failure of
    /// that phase.
    pub fn install_with_hooks(
        &self,
        request: &UpdateRequest,
        cancel: &CancelToken,
        observe: Observer<'_>,
        hook: Hook<'_>,
    ) -> InstallResult {
        let target = match normalize_bundle_path(&request.target_bundle_path) {
            Ok(target) => target,
            Err(err) => {
                let err = InstallError::Bundle(BundleError::NotABundle {
                    path: request.target_bundle_path.clone(),
                    reason: format!("{err:#}"),
                });
                return InstallResult::failed(None, request.target_bundle_path.clone(), &err);
            }
        };

        let txid = match new_txid() {
            Ok(txid) => txid,
            Err(err) => {
                let err = InstallError::io(InstallPhase::Idle, err);
                return InstallResult::failed(None, target, &err);
            }
        };

        let _lease = match self.locks.acquire(&self.layout, &target, &txid) {
            Ok(lease) => lease,
            Err(LeaseError::Busy { holder }) => {
                info!(
                    target = %target.display(),
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "rejecting install: target busy"
                );
                let err = InstallError::Busy(target.clone());
                return InstallResult::failed(None, target, &err);
            }
            Err(LeaseError::Io(err)) => {
                let err = InstallError::io(InstallPhase::Idle, err);
                return InstallResult::failed(None, target, &err);
            }
        };

        // Interrupted work on this target is settled before it is touched again.
        match self.recover_target_locked(&target) {
            Ok(recovered) => {
                for result in recovered {
                    info!(
                        target = %target.display(),
                        txid = result.txid.as_deref().unwrap_or("-"),
                        status = result.status.as_str(),
                        "settled interrupted install before new request"
                    );
                }
            }
            Err(err) => {
                let err = InstallError::io(InstallPhase::Idle, err);
                return InstallResult::failed(None, target, &err);
            }
        }

        match self.run_install(request, &target, txid, cancel, observe, hook) {
            Ok(result) => result,
            Err(err) => {
                info!(
                    target = %target.display(),
                    kind = %err.kind(),
                    error = %err,
                    "install rejected before any change"
                );
                observe(InstallPhase::Failed);
                InstallResult::failed(None, target, &err)
            }
        }
    }

    /// Errors returned here happened before the first mutation.
    fn run_install(
        &self,
        request: &UpdateRequest,
        target: &Path,
        txid: String,
        cancel: &CancelToken,
        observe: Observer<'_>,
        hook: Hook<'_>,
    ) -> Result<InstallResult, InstallError> {
        let staged = normalize_bundle_path(&request.staged_update_path).map_err(|err| {
            InstallError::Bundle(BundleError::NotABundle {
                path: request.staged_update_path.clone(),
                reason: format!("{err:#}"),
            })
        })?;
        if staged == target {
            return Err(InstallError::CorruptBundle(
                "staged update path is the installed bundle itself".to_string(),
            ));
        }

        let installed = resolve(target)?;
        let stage = validate(&staged)?;
        if installed.bundle_identifier != stage.identity.bundle_identifier {
            return Err(InstallError::IdentityMismatch {
                installed: installed.bundle_identifier,
                staged: stage.identity.bundle_identifier,
            });
        }
        if installed.same_release(&stage.identity) {
            info!(
                target = %target.display(),
                version = %installed.version_label(),
                "installed bundle already at staged version; nothing to do"
            );
            return Ok(InstallResult::success(None, target.to_path_buf()));
        }
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        info!(
            txid = %txid,
            target = %target.display(),
            from = %installed.version_label(),
            to = %stage.identity.version_label(),
            requester_uid = request.requester_identity.uid,
            "starting install"
        );

        let state = InstallState {
            version: INSTALL_STATE_VERSION,
            scratch_path: scratch_path(target, &txid),
            txid,
            current_phase: InstallPhase::Idle,
            target_path: target.to_path_buf(),
            staged_path: staged,
            backup_path: None,
            expected_identity: stage.identity.clone(),
            expected_digest: Some(stage.digest.clone()),
            last_error: None,
            started_at_unix: current_unix_timestamp()
                .map_err(|err| InstallError::io(InstallPhase::Idle, err))?,
        };
        write_install_state(&self.layout, &state)
            .map_err(|err| InstallError::io(InstallPhase::Idle, err))?;

        if let Err(err) = prepare_scratch(&stage, &state.scratch_path) {
            let _ = clear_install_state(&self.layout, &state.txid);
            return Err(InstallError::io(InstallPhase::Idle, err));
        }

        Ok(self.swap(state, cancel, observe, hook))
    }

    fn swap(
        &self,
        mut state: InstallState,
        cancel: &CancelToken,
        observe: Observer<'_>,
        hook: Hook<'_>,
    ) -> InstallResult {
        let target = state.target_path.clone();
        let scratch = state.scratch_path.clone();

        // Idle -> BackingUp
        let backup = backup_path(&target, &state.txid);
        state.backup_path = Some(backup.clone());
        let backed_up = self
            .enter(&mut state, InstallPhase::BackingUp, observe, hook)
            .and_then(|_| rename_durable(&target, &backup));
        if let Err(err) = backed_up {
            let err = InstallError::io(InstallPhase::BackingUp, err);
            return self.abort_before_backup(state, err, observe);
        }

        // BackingUp -> Installing
        if cancel.is_cancelled() {
            return self.roll_back(state, InstallError::Cancelled, observe);
        }
        if let Err(err) = self.enter(&mut state, InstallPhase::Installing, observe, hook) {
            return self.roll_back(state, InstallError::io(InstallPhase::Installing, err), observe);
        }
        if let Err(err) = rename_durable(&scratch, &target) {
            return self.roll_back(state, InstallError::io(InstallPhase::Installing, err), observe);
        }

        // Installing -> Verifying
        if cancel.is_cancelled() {
            return self.roll_back(state, InstallError::Cancelled, observe);
        }
        if let Err(err) = self.enter(&mut state, InstallPhase::Verifying, observe, hook) {
            return self.roll_back(state, InstallError::io(InstallPhase::Verifying, err), observe);
        }
        if let Err(err) = self.verify_installed(&state) {
            return self.roll_back(state, err, observe);
        }

        // Verifying -> Committed
        if cancel.is_cancelled() {
            return self.roll_back(state, InstallError::Cancelled, observe);
        }
        self.commit(state, observe)
    }

    fn enter(
        &self,
        state: &mut InstallState,
        phase: InstallPhase,
        observe: Observer<'_>,
        hook: Hook<'_>,
    ) -> Result<()> {
        state.current_phase = phase;
        write_install_state(&self.layout, state)?;
        debug!(txid = %state.txid, phase = %phase, "entered phase");
        observe(phase);
        hook(phase, state)
    }

    fn verify_installed(&self, state: &InstallState) -> Result<(), InstallError> {
        let installed = resolve(&state.target_path)
            .map_err(|err| InstallError::VerificationFailed(err.to_string()))?;
        let expected = &state.expected_identity;
        if !installed.same_release(expected) {
            return Err(InstallError::VerificationFailed(format!(
                "expected {} {}, found {} {}",
                expected.bundle_identifier,
                expected.version_label(),
                installed.bundle_identifier,
                installed.version_label()
            )));
        }

        if !self.options.verify_digest {
            return Ok(());
        }
        let Some(expected_digest) = &state.expected_digest else {
            return Ok(());
        };
        let actual = bundle_digest(&state.target_path)
            .map_err(|err| InstallError::VerificationFailed(format!("{err:#}")))?;
        if &actual != expected_digest {
            return Err(InstallError::VerificationFailed(format!(
                "content digest {actual} does not match staged digest {expected_digest}"
            )));
        }
        Ok(())
    }

    fn commit(&self, mut state: InstallState, observe: Observer<'_>) -> InstallResult {
        let target = state.target_path.clone();
        let txid = state.txid.clone();

        state.current_phase = InstallPhase::Committed;
        if let Err(err) = write_install_state(&self.layout, &state) {
            warn!(txid = %txid, error = %format!("{err:#}"), "failed to journal commit");
        }
        observe(InstallPhase::Committed);

        let mut result = InstallResult::success(Some(txid.clone()), target.clone());
        let backup_removed = match &state.backup_path {
            Some(backup) => match remove_dir_if_exists(backup) {
                Ok(()) => true,
                Err(err) => {
                    // The record stays so the next recovery pass retries the delete.
                    warn!(
                        txid = %txid,
                        backup = %backup.display(),
                        error = %err,
                        "install committed but backup could not be removed"
                    );
                    result.backup_path = Some(backup.clone());
                    false
                }
            },
            None => true,
        };
        self.release_scratch(&state);
        if backup_removed {
            self.forget(&txid);
        }

        info!(
            txid = %txid,
            target = %target.display(),
            version = %state.expected_identity.version_label(),
            "install committed"
        );
        result
    }

    fn abort_before_backup(
        &self,
        state: InstallState,
        err: InstallError,
        observe: Observer<'_>,
    ) -> InstallResult {
        error!(
            txid = %state.txid,
            target = %state.target_path.display(),
            error = %err,
            "could not back up installed bundle; nothing was changed"
        );
        self.release_scratch(&state);
        self.forget(&state.txid);
        observe(InstallPhase::Failed);
        InstallResult::failed(Some(state.txid), state.target_path, &err)
    }

    fn roll_back(
        &self,
        mut state: InstallState,
        cause: InstallError,
        observe: Observer<'_>,
    ) -> InstallResult {
        let target = state.target_path.clone();
        let txid = state.txid.clone();
        warn!(
            txid = %txid,
            target = %target.display(),
            phase = %state.current_phase,
            cause = %cause,
            "rolling back install"
        );

        state.last_error = Some(cause.to_string());
        state.current_phase = InstallPhase::RollingBack;
        if let Err(err) = write_install_state(&self.layout, &state) {
            warn!(txid = %txid, error = %format!("{err:#}"), "failed to journal rollback");
        }
        observe(InstallPhase::RollingBack);

        match self.restore_backup(&state) {
            Ok(()) => {
                self.release_scratch(&state);
                self.forget(&txid);
                observe(InstallPhase::RolledBack);
                info!(txid = %txid, target = %target.display(), "original bundle restored");
                InstallResult::rolled_back(Some(txid), target, Some(&cause))
            }
            Err(err) => {
                let backup = state
                    .backup_path
                    .clone()
                    .unwrap_or_else(|| backup_path(&target, &txid));
                let failure = InstallError::RollbackFailure {
                    backup: backup.clone(),
                    detail: format!("{err:#} (rolling back after: {cause})"),
                };
                state.current_phase = InstallPhase::Failed;
                state.last_error = Some(failure.to_string());
                if let Err(err) = write_install_state(&self.layout, &state) {
                    warn!(txid = %txid, error = %format!("{err:#}"), "failed to journal failure");
                }
                observe(InstallPhase::Failed);
                error!(
                    txid = %txid,
                    target = %target.display(),
                    backup = %backup.display(),
                    error = %failure,
                    "rollback failed; manual recovery required"
                );
                InstallResult::failed(Some(txid), target, &failure)
            }
        }
    }

    fn restore_backup(&self, state: &InstallState) -> Result<()> {
        let backup = state
            .backup_path
            .as_deref()
            .context("no backup was recorded for this install")?;
        if !path_present(backup) {
            return Err(anyhow!("backup {} is missing", backup.display()));
        }

        let target = &state.target_path;
        if path_present(target) {
            let discard = discard_path(target, &state.txid);
            remove_any_if_exists(&discard)
                .with_context(|| format!("failed to clear {}", discard.display()))?;
            rename_durable(target, &discard)?;
            if let Err(err) = remove_any_if_exists(&discard) {
                warn!(path = %discard.display(), error = %err, "failed to delete discarded bundle");
            }
        }
        rename_durable(backup, target)
    }

    fn release_scratch(&self, state: &InstallState) {
        if let Err(err) = return_scratch(&state.staged_path, &state.scratch_path) {
            warn!(
                txid = %state.txid,
                scratch = %state.scratch_path.display(),
                error = %format!("{err:#}"),
                "failed to release scratch bundle"
            );
        }
    }

    fn forget(&self, txid: &str) {
        if let Err(err) = clear_install_state(&self.layout, txid) {
            warn!(txid = %txid, error = %format!("{err:#}"), "failed to clear transaction record");
        }
    }

    /// Settles every journaled install left behind by a previous run, using
    /// only what is on disk. Targets locked by a live process are skipped.
    pub fn recover(&self) -> Result<Vec<InstallResult>> {
        let mut results = Vec::new();
        for state in read_all_install_states(&self.layout)? {
            let _lease = match self.locks.acquire(&self.layout, &state.target_path, &state.txid) {
                Ok(lease) => lease,
                Err(LeaseError::Busy { .. }) => {
                    info!(
                        txid = %state.txid,
                        target = %state.target_path.display(),
                        "skipping recovery: target is in use"
                    );
                    continue;
                }
                Err(LeaseError::Io(err)) => return Err(err),
            };
            // Settled meanwhile by an install on the same target.
            if read_install_state(&self.layout, &state.txid)?.is_none() {
                continue;
            }
            results.push(self.reconcile(state));
        }
        Ok(results)
    }

    fn recover_target_locked(&self, target: &Path) -> Result<Vec<InstallResult>> {
        Ok(read_all_install_states(&self.layout)?
            .into_iter()
            .filter(|state| state.target_path == target)
            .map(|state| self.reconcile(state))
            .collect())
    }

    fn reconcile(&self, state: InstallState) -> InstallResult {
        let target = state.target_path.clone();
        let txid = state.txid.clone();
        let backup_present = state.backup_path.as_deref().is_some_and(path_present);
        let target_present = path_present(&target);
        let target_is_update = target_present && self.target_matches_expected(&state);
        info!(
            txid = %txid,
            target = %target.display(),
            phase = %state.current_phase,
            backup_present,
            target_present,
            target_is_update,
            "reconciling interrupted install"
        );

        let observe = &mut |_: InstallPhase| {};
        // A committed install only ever has its backup deleted; the target is
        // the application's now and may legitimately differ from the stage.
        if state.current_phase == InstallPhase::Committed {
            if target_present {
                return self.commit(state, observe);
            }
            return self.keep_for_operator(
                state,
                "committed bundle is missing; backup left untouched".to_string(),
            );
        }

        match (backup_present, target_present) {
            (true, _) if target_is_update => self.commit(state, observe),
            (true, _) => {
                let cause = InstallError::TransientIo {
                    phase: state.current_phase,
                    detail: "installer stopped before the swap completed".to_string(),
                };
                self.roll_back(state, cause, observe)
            }
            (false, true) => {
                self.release_scratch(&state);
                self.forget(&txid);
                if target_is_update {
                    InstallResult::success(Some(txid), target)
                } else {
                    InstallResult::rolled_back(Some(txid), target, None)
                }
            }
            (false, false) => self.keep_for_operator(
                state,
                "neither the installed bundle nor its backup exists".to_string(),
            ),
        }
    }

    /// Keeps the record for manual recovery. A committed record stays
    /// committed so later passes never roll it back.
    fn keep_for_operator(&self, mut state: InstallState, detail: String) -> InstallResult {
        let target = state.target_path.clone();
        let txid = state.txid.clone();
        let backup = state
            .backup_path
            .clone()
            .unwrap_or_else(|| backup_path(&target, &txid));
        let failure = InstallError::RollbackFailure { backup, detail };
        error!(txid = %txid, target = %target.display(), "{failure}");
        if state.current_phase != InstallPhase::Committed {
            state.current_phase = InstallPhase::Failed;
        }
        state.last_error = Some(failure.to_string());
        if let Err(err) = write_install_state(&self.layout, &state) {
            warn!(txid = %txid, error = %format!("{err:#}"), "failed to journal failure");
        }
        InstallResult::failed(Some(txid), target, &failure)
    }

    fn target_matches_expected(&self, state: &InstallState) -> bool {
        let Ok(installed) = resolve(&state.target_path) else {
            return false;
        };
        if !installed.same_release(&state.expected_identity) {
            return false;
        }
        match (&state.expected_digest, self.options.verify_digest) {
            (Some(expected), true) => bundle_digest(&state.target_path)
                .map(|actual| &actual == expected)
                .unwrap_or(false),
            _ => true,
        }
    }
}

/// Paths an install of `target` under `txid` may leave next to it.
pub fn sibling_paths(target: &Path, txid: &str) -> [PathBuf; 3] {
    [
        backup_path(target, txid),
        scratch_path(target, txid),
        discard_path(target, txid),
    ]
}
