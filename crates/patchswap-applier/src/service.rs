use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use patchswap_core::{
    PatchOperationSet, PatchReference, UpdateError, UpdateManifestDocument, UpdateRecord,
    UpdateState,
};

use crate::fs_utils::{current_unix_timestamp, remove_dir_if_exists};
use crate::log::rotate_logs;
use crate::status::{try_read_status, write_status};
use crate::store::{load_manifest, persist_manifest};
use crate::{
    apply_active_update, supervise, wait_for_status, wait_until, ApplyOutcome, CancelToken,
    FinalizeOutcome, LaunchSpec, LockProbe, PlatformCapabilities, ProcessLauncher,
    RelaunchCoordinator, RelaunchOutcome, RetryPolicy, SentinelLockProbe, StdProcessLauncher,
    UpdateLayout, WaitOutcome,
};

/// Environment passed to a relaunched application.
pub const RELAUNCH_ENV_UPDATE_ROOT: &str = "PATCHSWAP_UPDATE_ROOT";
pub const RELAUNCH_ENV_MARKER: &str = "PATCHSWAP_RELAUNCHED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub install_root: PathBuf,
    /// Where `updates/` lives; the install root when unset.
    pub update_root: Option<PathBuf>,
    pub app_binary: Option<PathBuf>,
    pub app_args: Vec<String>,
    pub platform: PlatformCapabilities,
    pub poll: RetryPolicy,
    pub relaunch_timeout_ms: u64,
    pub trusted_public_key_hex: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::new(),
            update_root: None,
            app_binary: None,
            app_args: Vec::new(),
            platform: PlatformCapabilities::for_current_platform(),
            poll: RetryPolicy::default(),
            relaunch_timeout_ms: 60_000,
            trusted_public_key_hex: None,
        }
    }
}

impl UpdaterConfig {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse updater config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read updater config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid updater config: {}", path.display()))
    }

    pub fn layout(&self) -> UpdateLayout {
        let layout = UpdateLayout::new(&self.install_root, self.platform.clone());
        match &self.update_root {
            Some(update_root) => layout.with_update_root(update_root),
            None => layout,
        }
    }

    pub fn relaunch_timeout(&self) -> Duration {
        Duration::from_millis(self.relaunch_timeout_ms)
    }
}

/// Where the operations of a staged update come from.
#[derive(Debug, Clone)]
pub enum PatchSource {
    /// A directory holding `patch.toml` and `payload/`.
    Directory(PathBuf),
    Operations(PatchOperationSet),
}

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub name: String,
    pub channel: Option<String>,
    pub build_id: Option<String>,
    pub app_version: Option<String>,
    pub channel_change: bool,
    pub sha256: Option<String>,
    pub signature: Option<String>,
    pub payload: PatchSource,
}

impl StageRequest {
    pub fn new(name: impl Into<String>, payload: PatchSource) -> Self {
        Self {
            name: name.into(),
            channel: None,
            build_id: None,
            app_version: None,
            channel_change: false,
            sha256: None,
            signature: None,
            payload,
        }
    }
}

/// Handle to an apply running on its own thread. Its result is reported
/// through the status record, not through this handle.
#[derive(Debug)]
pub struct BackgroundApply {
    handle: JoinHandle<()>,
}

impl BackgroundApply {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| anyhow!("background apply thread panicked"))
    }
}

/// Entry point tying the stages together for one installation.
#[derive(Clone)]
pub struct UpdateService {
    config: Arc<UpdaterConfig>,
    layout: UpdateLayout,
    probe: Arc<dyn LockProbe>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl UpdateService {
    pub fn new(config: UpdaterConfig) -> Self {
        let probe = SentinelLockProbe::new(config.platform.lock_sentinel.clone());
        Self {
            layout: config.layout(),
            config: Arc::new(config),
            probe: Arc::new(probe),
            launcher: Arc::new(StdProcessLauncher),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LockProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn layout(&self) -> &UpdateLayout {
        &self.layout
    }

    /// Writes a new patch directory and makes it the active update. Refused
    /// while another update is still in flight.
    pub fn stage_update(&self, request: StageRequest) -> Result<UpdateRecord> {
        let layout = &self.layout;
        layout.ensure_base_dirs()?;
        let mut document = load_manifest(layout)?;

        if let Some(active) = &document.active {
            let state = try_read_status(layout)?.unwrap_or(active.state);
            if !state.is_terminal() {
                return Err(UpdateError::UpdateAlreadyActive(state.as_status_token()).into());
            }
            let index = active.patch.index;
            rotate_logs(layout, index)?;
            let patch_dir = layout.patch_dir(index);
            remove_dir_if_exists(&patch_dir)
                .with_context(|| format!("failed to remove {}", patch_dir.display()))?;
            document.archive_active();
        }

        let operations = match request.payload {
            PatchSource::Directory(dir) => PatchOperationSet::load_from_dir(&dir)
                .with_context(|| format!("failed to load patch from {}", dir.display()))?,
            PatchSource::Operations(operations) => operations,
        };

        let index = layout.next_patch_index();
        let patch_dir = layout.patch_dir(index);
        operations
            .write_to_dir(&patch_dir)
            .with_context(|| format!("failed to stage patch into {}", patch_dir.display()))?;

        let state = if layout.platform().applies_through_service {
            UpdateState::PendingService
        } else {
            UpdateState::Pending
        };
        let mut record = UpdateRecord::new(
            request.name,
            PatchReference {
                index,
                sha256: request.sha256,
                signature: request.signature,
            },
        );
        record.state = state;
        record.channel = request.channel;
        record.build_id = request.build_id;
        record.app_version = request.app_version;
        record.channel_change = request.channel_change;
        record.staged_at_unix = current_unix_timestamp()?;

        document.active = Some(record.clone());
        persist_manifest(layout, &document)?;
        write_status(layout, state)?;
        tracing::info!(
            update = %record.name,
            index,
            operations = operations.len(),
            "update staged"
        );
        Ok(record)
    }

    pub fn apply(&self) -> Result<ApplyOutcome> {
        apply_active_update(
            &self.layout,
            self.probe.as_ref(),
            self.config.trusted_public_key_hex.as_deref(),
        )
    }

    /// Starts the apply on a named thread and returns at once.
    pub fn apply_in_background(&self) -> Result<BackgroundApply> {
        let service = self.clone();
        let handle = thread::Builder::new()
            .name("patchswap-apply".to_string())
            .spawn(move || match service.apply() {
                Ok(outcome) => tracing::info!(?outcome, "background apply finished"),
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "background apply failed")
                }
            })
            .context("failed to spawn background apply thread")?;
        Ok(BackgroundApply { handle })
    }

    pub fn finalize_after_relaunch(&self) -> Result<FinalizeOutcome> {
        RelaunchCoordinator::new(&self.layout, self.probe.as_ref()).finalize(None)
    }

    /// Retries finalize under the poll policy until it stops reporting
    /// `NotReady` or `Blocked`.
    pub fn finalize_when_ready(&self, cancel: &CancelToken) -> Result<WaitOutcome<FinalizeOutcome>> {
        wait_until(&self.config.poll, cancel, || {
            match self.finalize_after_relaunch()? {
                FinalizeOutcome::NotReady(_) | FinalizeOutcome::Blocked => Ok(None),
                outcome => Ok(Some(outcome)),
            }
        })
    }

    pub fn current_state(&self) -> Result<Option<UpdateState>> {
        try_read_status(&self.layout)
    }

    pub fn manifest(&self) -> Result<UpdateManifestDocument> {
        load_manifest(&self.layout)
    }

    /// Waits for the apply phase to leave `pending`/`applying`.
    pub fn wait_for_apply(&self, cancel: &CancelToken) -> Result<WaitOutcome<UpdateState>> {
        wait_for_status(&self.layout, &self.config.poll, cancel, |state| {
            state.is_terminal_for_apply()
        })
    }

    /// Starts the configured application and supervises it. Never changes
    /// the status record.
    pub fn relaunch(&self, cancel: &CancelToken) -> Result<RelaunchOutcome> {
        let program = self
            .config
            .app_binary
            .clone()
            .ok_or_else(|| anyhow!("no application binary configured for relaunch"))?;
        let spec = LaunchSpec::new(program)
            .args(self.config.app_args.iter().cloned())
            .current_dir(self.layout.install_root())
            .env(
                RELAUNCH_ENV_UPDATE_ROOT,
                self.layout.update_root().display().to_string(),
            )
            .env(RELAUNCH_ENV_MARKER, "1");

        let mut handle = self.launcher.launch(&spec)?;
        supervise(
            handle.as_mut(),
            &self.config.poll,
            self.config.relaunch_timeout(),
            cancel,
        )
    }
}
