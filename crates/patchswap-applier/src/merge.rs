use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use patchswap_core::UpdateError;

use crate::fs_utils::{collect_relative_entries, copy_entry, remove_file_if_exists};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub copied: usize,
    pub removed: usize,
}

/// Makes `original` match `alternate`: every alternate file is copied over,
/// then original entries the alternate lacks are deleted. Entries under
/// `reserved` are left alone on both sides.
pub fn merge_alternate_into(
    alternate: &Path,
    original: &Path,
    reserved: &[PathBuf],
) -> Result<MergeSummary> {
    let mut summary = MergeSummary::default();

    let alternate_entries = collect_relative_entries(alternate, reserved)?;
    for relative in &alternate_entries {
        let from_path = alternate.join(relative);
        let to_path = original.join(relative);
        let metadata = fs::symlink_metadata(&from_path)
            .with_context(|| format!("failed to stat {}", from_path.display()))?;

        if metadata.is_dir() {
            if fs::symlink_metadata(&to_path).is_ok_and(|existing| !existing.is_dir()) {
                remove_file_if_exists(&to_path)
                    .with_context(|| format!("failed to replace {}", to_path.display()))?;
            }
            fs::create_dir_all(&to_path)
                .with_context(|| format!("failed to create {}", to_path.display()))?;
            continue;
        }

        replace_with(&from_path, &to_path, &metadata)?;
        summary.copied += 1;
    }

    let keep: HashSet<&PathBuf> = alternate_entries.iter().collect();
    let mut stale: Vec<PathBuf> = collect_relative_entries(original, reserved)?
        .into_iter()
        .filter(|relative| !keep.contains(relative))
        .collect();
    // deepest first so children go before their directories
    stale.sort_by_key(|relative| std::cmp::Reverse(relative.components().count()));

    for relative in stale {
        let path = original.join(&relative);
        let removed = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => Err(err),
        };
        removed.with_context(|| format!("failed to remove stale entry {}", path.display()))?;
        summary.removed += 1;
    }

    tracing::debug!(
        copied = summary.copied,
        removed = summary.removed,
        "merged alternate directory"
    );
    Ok(summary)
}

fn replace_with(from_path: &Path, to_path: &Path, metadata: &fs::Metadata) -> Result<()> {
    match fs::symlink_metadata(to_path) {
        Ok(existing) if existing.is_dir() => {
            fs::remove_dir_all(to_path)
                .with_context(|| format!("failed to replace directory {}", to_path.display()))?;
        }
        _ => {}
    }

    if metadata.file_type().is_symlink() {
        return copy_entry(from_path, to_path, metadata);
    }

    let mut staged_name = to_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    staged_name.push(".patchswap-merge");
    let staged = to_path.with_file_name(staged_name);
    copy_entry(from_path, &staged, metadata)?;
    fs::rename(&staged, to_path)
        .map_err(|err| UpdateError::MergeFailure(format!("{}: {err}", to_path.display())))?;
    Ok(())
}
