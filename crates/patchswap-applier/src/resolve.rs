use anyhow::{Context, Result};

use patchswap_core::TargetDirectoryResolution;

use crate::fs_utils::{copy_tree_excluding, remove_dir_if_exists};
use crate::{LockProbe, UpdateLayout};

/// Decides where the patch is applied. A held install root gets a freshly
/// populated twin next to it; otherwise the patch goes in place.
pub fn resolve_target(
    layout: &UpdateLayout,
    probe: &dyn LockProbe,
) -> Result<TargetDirectoryResolution> {
    let original = layout.install_root();
    if !probe.is_held(original)? {
        tracing::debug!(root = %original.display(), "install root is free, applying in place");
        return Ok(TargetDirectoryResolution::in_place(original));
    }

    let alternate = layout.alternate_root()?;
    tracing::info!(
        root = %original.display(),
        alternate = %alternate.display(),
        "install root is held, staging into alternate directory"
    );

    remove_dir_if_exists(&alternate).with_context(|| {
        format!(
            "failed to remove stale alternate directory: {}",
            alternate.display()
        )
    })?;

    let mut excluded = layout.reserved_relative_paths();
    if let Ok(nested) = alternate.strip_prefix(original) {
        excluded.push(nested.to_path_buf());
    }
    let copied = copy_tree_excluding(original, &alternate, &excluded).with_context(|| {
        format!(
            "failed to populate alternate directory {} from {}",
            alternate.display(),
            original.display()
        )
    })?;
    tracing::debug!(copied, "alternate directory populated");

    Ok(TargetDirectoryResolution::alternate(alternate))
}
