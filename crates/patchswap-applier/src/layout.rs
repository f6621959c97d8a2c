use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::PlatformCapabilities;

/// Paths of an installation and of the update state kept beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    install_root: PathBuf,
    update_root: PathBuf,
    platform: PlatformCapabilities,
}

impl UpdateLayout {
    pub fn new(install_root: impl Into<PathBuf>, platform: PlatformCapabilities) -> Self {
        let install_root = install_root.into();
        Self {
            update_root: install_root.clone(),
            install_root,
            platform,
        }
    }

    pub fn with_update_root(mut self, update_root: impl Into<PathBuf>) -> Self {
        self.update_root = update_root.into();
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn update_root(&self) -> &Path {
        &self.update_root
    }

    pub fn platform(&self) -> &PlatformCapabilities {
        &self.platform
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.update_root.join("updates")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.updates_dir().join("updates.toml")
    }

    pub fn status_path(&self) -> PathBuf {
        self.updates_dir().join("update.status")
    }

    pub fn patch_dir(&self, index: u32) -> PathBuf {
        self.updates_dir().join(index.to_string())
    }

    pub fn patch_log_path(&self, index: u32) -> PathBuf {
        self.patch_dir(index).join("update.log")
    }

    pub fn last_log_path(&self) -> PathBuf {
        self.updates_dir().join("last-update.log")
    }

    pub fn backup_log_path(&self) -> PathBuf {
        self.updates_dir().join("backup-update.log")
    }

    pub fn application_ini_path(&self) -> PathBuf {
        self.install_root.join("application.ini")
    }

    pub fn lock_sentinel_path(&self, root: &Path) -> PathBuf {
        root.join(&self.platform.lock_sentinel)
    }

    pub fn removal_ledger_path(&self, root: &Path) -> PathBuf {
        root.join("removed-files")
    }

    /// Sibling of the install root named `<leaf><alternate_suffix>`.
    pub fn alternate_root(&self) -> Result<PathBuf> {
        let parent = self.install_root.parent().ok_or_else(|| {
            anyhow!(
                "install root has no parent directory: {}",
                self.install_root.display()
            )
        })?;
        let leaf = self.install_root.file_name().ok_or_else(|| {
            anyhow!(
                "install root has no leaf name: {}",
                self.install_root.display()
            )
        })?;
        let mut name = leaf.to_os_string();
        name.push(&self.platform.alternate_suffix);
        Ok(parent.join(name))
    }

    /// Paths, relative to an install root, that belong to the updater rather
    /// than to the application and are never copied, merged or patched.
    pub fn reserved_relative_paths(&self) -> Vec<PathBuf> {
        let mut reserved = vec![PathBuf::from(&self.platform.lock_sentinel)];
        if let Ok(relative) = self.updates_dir().strip_prefix(&self.install_root) {
            reserved.push(relative.to_path_buf());
        }
        reserved
    }

    pub fn is_reserved(&self, relative: &Path) -> bool {
        let normalized: PathBuf = relative
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .collect();
        self.reserved_relative_paths()
            .iter()
            .any(|reserved| normalized.starts_with(reserved))
    }

    /// Smallest patch index whose directory does not exist yet.
    pub fn next_patch_index(&self) -> u32 {
        let mut index = 0;
        while self.patch_dir(index).exists() {
            index += 1;
        }
        index
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        let dir = self.updates_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(())
    }
}
