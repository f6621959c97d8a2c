use serde::{Deserialize, Serialize};

/// Per-platform behaviour, resolved once when the updater is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Appended to the install directory name to form the alternate root.
    pub alternate_suffix: String,
    /// File inside the install root that the running application holds.
    pub lock_sentinel: String,
    /// Keep `updates/<n>/` (and its log) after a successful finalize.
    pub retain_patch_dir_after_finalize: bool,
    /// Apply reports `applied-service` and staging reports `pending-service`.
    pub applies_through_service: bool,
}

impl PlatformCapabilities {
    pub fn for_current_platform() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else if cfg!(target_os = "macos") {
            Self::macos()
        } else {
            Self::linux()
        }
    }

    pub fn linux() -> Self {
        Self {
            alternate_suffix: ".updated".to_string(),
            lock_sentinel: ".patchswap.lock".to_string(),
            retain_patch_dir_after_finalize: false,
            applies_through_service: false,
        }
    }

    pub fn macos() -> Self {
        Self::linux()
    }

    // The update log lives in the per-user data directory on windows and
    // outlives the finalize step.
    pub fn windows() -> Self {
        Self {
            retain_patch_dir_after_finalize: true,
            ..Self::linux()
        }
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::for_current_platform()
    }
}
