use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use patchswap_core::{
    failure_code_for, is_older_version, FailureCode, IniDocument, PatchAction, PatchOperation,
    PatchOperationSet, PatchReference, TargetDirectoryResolution, UpdateError, UpdateRecord,
    UpdateState,
};
use patchswap_security::{sha256_hex, verify_ed25519_signature_hex, verify_sha256};

use crate::fs_utils::{current_unix_timestamp, remove_dir_if_exists, write_file_durable};
use crate::ledger::write_removal_ledger;
use crate::log::{read_completed_operations, CompletedOperations, LogEntry, OperationOutcome};
use crate::status::{try_read_status, write_status};
use crate::store::{archive_record, load_active_record, persist_active_record};
use crate::{resolve_target, ApplicationLog, LockProbe, UpdateLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied_count: usize,
    pub skipped_count: usize,
    pub resumed_count: usize,
    /// Relative paths actually removed, in operation order.
    pub removed: Vec<String>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyResult),
    /// Status was already applied or terminal; nothing was touched.
    AlreadyDone(UpdateState),
    /// The staged update is older than the installed application.
    Discarded,
    Failed { code: FailureCode, message: String },
}

/// Executes add/remove operations against one root, logging each result
/// before the next operation starts.
pub struct PatchEngine<'a> {
    layout: &'a UpdateLayout,
    probe: &'a dyn LockProbe,
}

impl<'a> PatchEngine<'a> {
    pub fn new(layout: &'a UpdateLayout, probe: &'a dyn LockProbe) -> Self {
        Self { layout, probe }
    }

    pub fn apply(
        &self,
        resolution: &TargetDirectoryResolution,
        operations: &PatchOperationSet,
        log: &mut ApplicationLog,
        completed: &CompletedOperations,
    ) -> Result<ApplyResult> {
        let root = &resolution.effective_root;
        let mut result = ApplyResult {
            applied_count: 0,
            skipped_count: 0,
            resumed_count: 0,
            removed: Vec::new(),
            log_path: log.path().to_path_buf(),
        };

        for (seq, operation) in operations.operations().iter().enumerate() {
            let action = operation.action();
            let path = operation.path();

            if completed.contains(seq, action, path) {
                log.append(&operation_entry(seq, operation, OperationOutcome::Resumed, None))?;
                if action == PatchAction::Remove {
                    result.removed.push(path.to_string());
                }
                result.resumed_count += 1;
                continue;
            }

            if action == PatchAction::Remove {
                log.append(&operation_entry(seq, operation, OperationOutcome::Started, None))?;
            }
            let executed = self
                .check_still_free(resolution)
                .and_then(|()| self.execute(root, operation));
            match executed {
                Ok(OperationOutcome::Skipped) if completed.was_started(seq, action, path) => {
                    // the interrupted attempt removed it before logging the result
                    tracing::debug!(seq, path, "remove finished by interrupted attempt");
                    log.append(&operation_entry(
                        seq,
                        operation,
                        OperationOutcome::Resumed,
                        Some("removed by interrupted attempt".to_string()),
                    ))?;
                    result.removed.push(path.to_string());
                    result.resumed_count += 1;
                }
                Ok(OperationOutcome::Skipped) => {
                    tracing::debug!(seq, action = action.as_str(), path, "operation skipped");
                    log.append(&operation_entry(
                        seq,
                        operation,
                        OperationOutcome::Skipped,
                        Some("target not present".to_string()),
                    ))?;
                    result.skipped_count += 1;
                }
                Ok(outcome) => {
                    tracing::debug!(seq, action = action.as_str(), path, "operation applied");
                    log.append(&operation_entry(seq, operation, outcome, None))?;
                    if action == PatchAction::Remove {
                        result.removed.push(path.to_string());
                    }
                    result.applied_count += 1;
                }
                Err(err) => {
                    log.append(&operation_entry(
                        seq,
                        operation,
                        OperationOutcome::Failed,
                        Some(format!("{err:#}")),
                    ))?;
                    return Err(err);
                }
            }
        }

        Ok(result)
    }

    // An in-place root must stay free for the whole attempt.
    fn check_still_free(&self, resolution: &TargetDirectoryResolution) -> Result<()> {
        if resolution.used_alternate {
            return Ok(());
        }
        if self.probe.is_held(&resolution.effective_root)? {
            return Err(UpdateError::LockContention(format!(
                "{} became held while applying",
                resolution.effective_root.display()
            ))
            .into());
        }
        Ok(())
    }

    fn execute(&self, root: &Path, operation: &PatchOperation) -> Result<OperationOutcome> {
        let relative = Path::new(operation.path());
        if self.layout.is_reserved(relative) {
            return Err(UpdateError::OperationConflict(format!(
                "'{}' is reserved for the updater",
                operation.path()
            ))
            .into());
        }

        let target = root.join(relative);
        match operation {
            PatchOperation::Add { bytes, .. } => add_file(&target, bytes),
            PatchOperation::Remove { .. } => remove_file(&target),
        }
    }
}

fn add_file(target: &Path, bytes: &[u8]) -> Result<OperationOutcome> {
    let previous = match fs::symlink_metadata(target) {
        Ok(metadata) => Some(metadata),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(UpdateError::from_io(err))
                .with_context(|| format!("failed to inspect {}", target.display()));
        }
    };
    if previous.as_ref().is_some_and(fs::Metadata::is_dir) {
        return Err(UpdateError::OperationConflict(format!(
            "cannot add file over directory {}",
            target.display()
        ))
        .into());
    }

    write_file_durable(target, bytes)
        .map_err(UpdateError::from_io)
        .with_context(|| format!("failed to write {}", target.display()))?;

    if let Some(metadata) = previous.filter(|metadata| metadata.is_file()) {
        fs::set_permissions(target, metadata.permissions())
            .map_err(UpdateError::from_io)
            .with_context(|| format!("failed to restore permissions on {}", target.display()))?;
    }
    Ok(OperationOutcome::Ok)
}

fn remove_file(target: &Path) -> Result<OperationOutcome> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(OperationOutcome::Skipped);
        }
        Err(err) => {
            return Err(UpdateError::from_io(err))
                .with_context(|| format!("failed to inspect {}", target.display()));
        }
    };
    if metadata.is_dir() {
        return Err(UpdateError::OperationConflict(format!(
            "remove target is a directory: {}",
            target.display()
        ))
        .into());
    }

    fs::remove_file(target)
        .map_err(UpdateError::from_io)
        .with_context(|| format!("failed to remove {}", target.display()))?;
    Ok(OperationOutcome::Ok)
}

fn operation_entry(
    seq: usize,
    operation: &PatchOperation,
    outcome: OperationOutcome,
    detail: Option<String>,
) -> LogEntry {
    LogEntry::Operation {
        seq,
        action: operation.action(),
        path: operation.path().to_string(),
        outcome,
        detail,
    }
}

/// Runs the apply phase for the active update: resolve the target, apply
/// the operations there, then record the outcome in the status last.
pub fn apply_active_update(
    layout: &UpdateLayout,
    probe: &dyn LockProbe,
    trusted_public_key_hex: Option<&str>,
) -> Result<ApplyOutcome> {
    let status = try_read_status(layout)?;
    if let Some(state) = status.filter(UpdateState::is_terminal_for_apply) {
        tracing::info!(status = %state, "nothing to apply");
        return Ok(ApplyOutcome::AlreadyDone(state));
    }
    layout.ensure_base_dirs()?;
    let mut record = load_active_record(layout)?;
    let state = status.unwrap_or(record.state);
    if state.is_terminal_for_apply() {
        tracing::info!(update = %record.name, status = %state, "nothing to apply");
        return Ok(ApplyOutcome::AlreadyDone(state));
    }

    if is_superseded_by_installed(layout, &record)? {
        return discard_update(layout, record);
    }

    let index = record.patch.index;
    let resuming = state == UpdateState::Applying;
    let mut completed = if resuming {
        match read_completed_operations(&layout.patch_log_path(index)) {
            Ok(completed) => completed,
            Err(err) => return record_failure(layout, record, &err),
        }
    } else {
        CompletedOperations::default()
    };

    let resolution = match record.resolution.clone() {
        Some(previous)
            if resuming && previous.used_alternate && previous.effective_root.exists() =>
        {
            previous
        }
        _ => {
            if resuming && record.resolution.as_ref().is_some_and(|r| r.used_alternate) {
                // the half-patched alternate is gone, start over
                completed = CompletedOperations::default();
            }
            match resolve_target(layout, probe) {
                Ok(resolution) => resolution,
                Err(err) => return record_failure(layout, record, &err),
            }
        }
    };

    match run_attempt(
        layout,
        probe,
        &mut record,
        &resolution,
        &completed,
        trusted_public_key_hex,
    ) {
        Ok(result) => Ok(ApplyOutcome::Applied(result)),
        Err(err) => record_failure(layout, record, &err),
    }
}

// Every error past this point is recorded as `failed: <code>` by the caller,
// so the status never stays at `applying`.
fn run_attempt(
    layout: &UpdateLayout,
    probe: &dyn LockProbe,
    record: &mut UpdateRecord,
    resolution: &TargetDirectoryResolution,
    completed: &CompletedOperations,
    trusted_public_key_hex: Option<&str>,
) -> Result<ApplyResult> {
    record.state = UpdateState::Applying;
    record.attempts += 1;
    record.resolution = Some(resolution.clone());
    persist_active_record(layout, record)?;
    write_status(layout, UpdateState::Applying)?;
    tracing::info!(
        update = %record.name,
        attempt = record.attempts,
        root = %resolution.effective_root.display(),
        used_alternate = resolution.used_alternate,
        resumed = completed.len(),
        "applying update"
    );

    let index = record.patch.index;
    let header = LogEntry::Attempt {
        attempt: record.attempts,
        update: record.name.clone(),
        started_at_unix: current_unix_timestamp()?,
        effective_root: resolution.effective_root.display().to_string(),
        used_alternate: resolution.used_alternate,
    };
    let mut log = ApplicationLog::begin_attempt(layout, index, header)?;

    let engine = PatchEngine::new(layout, probe);
    let result = match execute_patch(
        &engine,
        layout,
        record,
        resolution,
        completed,
        trusted_public_key_hex,
        &mut log,
    ) {
        Ok(result) => result,
        Err(err) => {
            let code = failure_code_for(&err);
            if let Err(log_err) = log.append(&LogEntry::Finish {
                result: UpdateState::Failed(code).as_status_token(),
            }) {
                tracing::warn!(error = %format!("{log_err:#}"), "failed to close application log");
            }
            return Err(err);
        }
    };

    log.append(&LogEntry::Finish {
        result: "applied".to_string(),
    })?;
    let applied_state = if layout.platform().applies_through_service {
        UpdateState::AppliedService
    } else {
        UpdateState::Applied
    };
    record.state = applied_state;
    persist_active_record(layout, record)?;
    write_status(layout, applied_state)?;
    tracing::info!(
        update = %record.name,
        applied = result.applied_count,
        skipped = result.skipped_count,
        removed = result.removed.len(),
        "update applied"
    );
    Ok(result)
}

fn execute_patch(
    engine: &PatchEngine<'_>,
    layout: &UpdateLayout,
    record: &UpdateRecord,
    resolution: &TargetDirectoryResolution,
    completed: &CompletedOperations,
    trusted_public_key_hex: Option<&str>,
    log: &mut ApplicationLog,
) -> Result<ApplyResult> {
    let patch_dir = layout.patch_dir(record.patch.index);
    let operations = PatchOperationSet::load_from_dir(&patch_dir).map_err(as_read_failure)?;
    verify_integrity(&record.patch, &operations, trusted_public_key_hex)?;

    let result = engine.apply(resolution, &operations, log, completed)?;
    write_removal_ledger(
        &layout.removal_ledger_path(&resolution.effective_root),
        &result.removed,
    )?;
    Ok(result)
}

// Errors without a typed cause while loading the patch are read failures.
fn as_read_failure(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<UpdateError>().is_some() {
        return err;
    }
    UpdateError::MalformedManifest(format!("{err:#}")).into()
}

/// Checks the payload digest and signature named by the patch reference.
pub fn verify_integrity(
    patch: &PatchReference,
    operations: &PatchOperationSet,
    trusted_public_key_hex: Option<&str>,
) -> Result<()> {
    if patch.sha256.is_none() && patch.signature.is_none() {
        return Ok(());
    }
    let input = operations.digest_input()?;

    if let Some(expected) = &patch.sha256 {
        if !verify_sha256(&input, expected) {
            return Err(UpdateError::IntegrityFailure(format!(
                "sha256 mismatch: expected {expected}, got {}",
                sha256_hex(&input)
            ))
            .into());
        }
    }

    if let Some(signature) = &patch.signature {
        let public_key = trusted_public_key_hex.ok_or_else(|| {
            UpdateError::IntegrityFailure(
                "patch is signed but no trusted public key is configured".to_string(),
            )
        })?;
        let verified = verify_ed25519_signature_hex(&input, public_key, signature)
            .map_err(|err| UpdateError::IntegrityFailure(format!("{err:#}")))?;
        if !verified {
            return Err(UpdateError::IntegrityFailure(
                "signature does not match patch payload".to_string(),
            )
            .into());
        }
    }
    Ok(())
}

/// True when the staged update targets a version older than the installed
/// one. Unknown versions and channel changes never count as older.
pub fn is_superseded_by_installed(layout: &UpdateLayout, record: &UpdateRecord) -> Result<bool> {
    if record.channel_change {
        return Ok(false);
    }
    let Some(update_version) = record.app_version.as_deref() else {
        return Ok(false);
    };
    let ini_path = layout.application_ini_path();
    if !ini_path.exists() {
        return Ok(false);
    }
    let ini = IniDocument::read(&ini_path)?;
    let Some(installed) = ini.get("App", "Version") else {
        return Ok(false);
    };
    Ok(is_older_version(update_version, installed))
}

fn discard_update(layout: &UpdateLayout, mut record: UpdateRecord) -> Result<ApplyOutcome> {
    tracing::warn!(
        update = %record.name,
        version = record.app_version.as_deref().unwrap_or("unknown"),
        "staged update is older than the installed application, discarding"
    );
    let patch_dir = layout.patch_dir(record.patch.index);
    remove_dir_if_exists(&patch_dir)
        .with_context(|| format!("failed to remove {}", patch_dir.display()))?;

    let state = UpdateState::Failed(FailureCode::OLDER_THAN_INSTALLED);
    record.state = state;
    archive_record(layout, &record)?;
    write_status(layout, state)?;
    Ok(ApplyOutcome::Discarded)
}

fn record_failure(
    layout: &UpdateLayout,
    mut record: UpdateRecord,
    err: &anyhow::Error,
) -> Result<ApplyOutcome> {
    let code = failure_code_for(err);
    let message = format!("{err:#}");
    tracing::warn!(update = %record.name, %code, error = %message, "update apply failed");

    let state = UpdateState::Failed(code);
    record.state = state;
    if let Err(persist_err) = persist_active_record(layout, &record) {
        tracing::warn!(error = %format!("{persist_err:#}"), "failed to persist failed record");
    }
    write_status(layout, state)?;
    Ok(ApplyOutcome::Failed { code, message })
}
