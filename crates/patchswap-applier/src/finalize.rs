use anyhow::{Context, Result};
use std::fmt;

use patchswap_core::{
    failure_code_for, FailureCode, TargetDirectoryResolution, UpdateError, UpdateRecord,
    UpdateState,
};

use crate::fs_utils::remove_dir_if_exists;
use crate::log::remove_rotated_logs;
use crate::merge::merge_alternate_into;
use crate::status::{try_read_status, write_status};
use crate::store::{archive_record, load_manifest, persist_active_record};
use crate::{LockProbe, UpdateLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Succeeded,
    Failed(FailureCode),
}

impl FinalState {
    pub fn from_state(state: UpdateState) -> Option<Self> {
        match state {
            UpdateState::Succeeded => Some(Self::Succeeded),
            UpdateState::Failed(code) => Some(Self::Failed(code)),
            _ => None,
        }
    }

    pub fn as_state(self) -> UpdateState {
        match self {
            Self::Succeeded => UpdateState::Succeeded,
            Self::Failed(code) => UpdateState::Failed(code),
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_state())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized(FinalState),
    /// Status was already terminal; nothing was touched.
    AlreadyTerminal(FinalState),
    /// Apply has not reported `applied` yet (or no status exists).
    NotReady(Option<UpdateState>),
    /// The original root is still held, so the alternate cannot be merged yet.
    Blocked,
}

/// Completes an applied update in the process generation that follows the
/// relaunch.
pub struct RelaunchCoordinator<'a> {
    layout: &'a UpdateLayout,
    probe: &'a dyn LockProbe,
}

impl<'a> RelaunchCoordinator<'a> {
    pub fn new(layout: &'a UpdateLayout, probe: &'a dyn LockProbe) -> Self {
        Self { layout, probe }
    }

    /// Finalizes against `resolution`, or the one apply recorded when `None`.
    pub fn finalize(
        &self,
        resolution: Option<&TargetDirectoryResolution>,
    ) -> Result<FinalizeOutcome> {
        let state = match try_read_status(self.layout)? {
            Some(state) => state,
            None => return Ok(FinalizeOutcome::NotReady(None)),
        };
        if let Some(terminal) = FinalState::from_state(state) {
            return Ok(FinalizeOutcome::AlreadyTerminal(terminal));
        }
        if !state.is_applied() {
            return Ok(FinalizeOutcome::NotReady(Some(state)));
        }

        let document = load_manifest(self.layout)?;
        let record = document.active;
        let resolution = resolution
            .cloned()
            .or_else(|| record.as_ref().and_then(|record| record.resolution.clone()))
            .unwrap_or_else(|| TargetDirectoryResolution::in_place(self.layout.install_root()));

        if resolution.used_alternate {
            let original = self.layout.install_root();
            let alternate = &resolution.effective_root;
            if !alternate.exists() {
                // merged and removed by a generation that died before the status write
                tracing::warn!(
                    alternate = %alternate.display(),
                    "alternate directory already gone, assuming it was merged"
                );
            } else {
                if self.probe.is_held(original)? {
                    tracing::info!(root = %original.display(), "install root still held, finalize deferred");
                    return Ok(FinalizeOutcome::Blocked);
                }
                let reserved = self.layout.reserved_relative_paths();
                if let Err(err) = merge_alternate_into(alternate, original, &reserved) {
                    let err = err.context(UpdateError::MergeFailure(format!(
                        "{} into {}",
                        alternate.display(),
                        original.display()
                    )));
                    return self.record_failure(record, &err);
                }
                if let Err(err) = remove_dir_if_exists(alternate) {
                    tracing::warn!(
                        alternate = %alternate.display(),
                        error = %err,
                        "failed to remove merged alternate directory"
                    );
                }
                tracing::info!(root = %original.display(), "alternate directory merged");
            }
        }

        if let Some(record) = &record {
            if !self.layout.platform().retain_patch_dir_after_finalize {
                let patch_dir = self.layout.patch_dir(record.patch.index);
                remove_dir_if_exists(&patch_dir)
                    .with_context(|| format!("failed to remove {}", patch_dir.display()))?;
            }
        }
        remove_rotated_logs(self.layout)?;

        if let Some(mut record) = record {
            record.state = UpdateState::Succeeded;
            archive_record(self.layout, &record)?;
            tracing::info!(update = %record.name, "update finalized");
        }
        write_status(self.layout, UpdateState::Succeeded)?;
        Ok(FinalizeOutcome::Finalized(FinalState::Succeeded))
    }

    fn record_failure(
        &self,
        record: Option<UpdateRecord>,
        err: &anyhow::Error,
    ) -> Result<FinalizeOutcome> {
        let code = failure_code_for(err);
        tracing::warn!(%code, error = %format!("{err:#}"), "finalize failed, alternate kept");
        let state = UpdateState::Failed(code);
        if let Some(mut record) = record {
            record.state = state;
            if let Err(persist_err) = persist_active_record(self.layout, &record) {
                tracing::warn!(error = %format!("{persist_err:#}"), "failed to persist failed record");
            }
        }
        write_status(self.layout, state)?;
        Ok(FinalizeOutcome::Finalized(FinalState::Failed(code)))
    }
}
