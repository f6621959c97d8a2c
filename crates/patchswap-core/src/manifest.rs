use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::state::UpdateState;

/// Number of archived records kept in the manifest document.
pub const MANIFEST_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchReference {
    /// Numbered patch directory under `updates/`.
    pub index: u32,
    pub sha256: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetDirectoryResolution {
    pub effective_root: PathBuf,
    pub used_alternate: bool,
}

impl TargetDirectoryResolution {
    pub fn in_place(root: impl Into<PathBuf>) -> Self {
        Self {
            effective_root: root.into(),
            used_alternate: false,
        }
    }

    pub fn alternate(root: impl Into<PathBuf>) -> Self {
        Self {
            effective_root: root.into(),
            used_alternate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    pub name: String,
    pub state: UpdateState,
    pub channel: Option<String>,
    pub build_id: Option<String>,
    pub app_version: Option<String>,
    #[serde(default)]
    pub channel_change: bool,
    #[serde(default)]
    pub staged_at_unix: u64,
    #[serde(default)]
    pub attempts: u32,
    // tables last so the TOML form stays valid
    pub patch: PatchReference,
    pub resolution: Option<TargetDirectoryResolution>,
}

impl UpdateRecord {
    pub fn new(name: impl Into<String>, patch: PatchReference) -> Self {
        Self {
            name: name.into(),
            state: UpdateState::Pending,
            channel: None,
            build_id: None,
            app_version: None,
            channel_change: false,
            staged_at_unix: 0,
            attempts: 0,
            patch,
            resolution: None,
        }
    }
}

/// The persisted document: one active update plus archived history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifestDocument {
    pub active: Option<UpdateRecord>,
    #[serde(default)]
    pub history: Vec<UpdateRecord>,
}

impl UpdateManifestDocument {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let document: Self = toml::from_str(input)
            .map_err(|err| UpdateError::MalformedManifest(err.to_string()))
            .context("failed to parse update manifest document")?;
        if let Some(active) = &document.active {
            validate_record(active)?;
        }
        Ok(document)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize update manifest document")
    }

    /// Moves the active record into history, newest first.
    pub fn archive_active(&mut self) -> Option<UpdateRecord> {
        let active = self.active.take()?;
        self.history.insert(0, active.clone());
        self.history.truncate(MANIFEST_HISTORY_LIMIT);
        Some(active)
    }
}

fn validate_record(record: &UpdateRecord) -> anyhow::Result<()> {
    if record.name.trim().is_empty() {
        return Err(UpdateError::MalformedManifest(
            "active update name must not be empty".to_string(),
        )
        .into());
    }
    if let Some(sha256) = &record.patch.sha256 {
        if sha256.len() != 64 || !sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(UpdateError::MalformedManifest(format!(
                "patch sha256 for '{}' must be 64 hex characters",
                record.name
            ))
            .into());
        }
    }
    Ok(())
}
