use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, and renames it over
/// `path`, so readers observe either the old or the new content.
pub fn write_file_durable(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = sibling_tmp_path(path);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Copies `src` into `dst`, skipping entries whose path relative to `src`
/// starts with one of `excluded`. Symlinks are recreated, not followed.
pub fn copy_tree_excluding(src: &Path, dst: &Path, excluded: &[PathBuf]) -> Result<u64> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let mut copied = 0_u64;
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(PathBuf::new());

    while let Some(relative_dir) = queue.pop_front() {
        let from_dir = src.join(&relative_dir);
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed to read {}", from_dir.display()))?
        {
            let entry = entry?;
            let relative = relative_dir.join(entry.file_name());
            if excluded.iter().any(|skip| relative.starts_with(skip)) {
                continue;
            }

            let from_path = entry.path();
            let to_path = dst.join(&relative);
            let metadata = fs::symlink_metadata(&from_path)
                .with_context(|| format!("failed to stat {}", from_path.display()))?;
            if metadata.is_dir() {
                fs::create_dir_all(&to_path)
                    .with_context(|| format!("failed to create {}", to_path.display()))?;
                queue.push_back(relative);
                continue;
            }

            copy_entry(&from_path, &to_path, &metadata)?;
            copied += 1;
        }
    }

    Ok(copied)
}

pub(crate) fn copy_entry(from_path: &Path, to_path: &Path, metadata: &fs::Metadata) -> Result<()> {
    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(from_path)
            .with_context(|| format!("failed to read symlink {}", from_path.display()))?;
        remove_file_if_exists(to_path)
            .with_context(|| format!("failed to replace {}", to_path.display()))?;
        std::os::unix::fs::symlink(&target, to_path).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                to_path.display(),
                target.display()
            )
        })?;
        return Ok(());
    }
    #[cfg(not(unix))]
    let _ = metadata;

    fs::copy(from_path, to_path).with_context(|| {
        format!(
            "failed to copy {} to {}",
            from_path.display(),
            to_path.display()
        )
    })?;
    Ok(())
}

/// Lists every entry under `root`, directories included, relative to it, skipping
/// `excluded` subtrees.
pub fn collect_relative_entries(root: &Path, excluded: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(PathBuf::new());

    while let Some(relative_dir) = queue.pop_front() {
        let dir = root.join(&relative_dir);
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let relative = relative_dir.join(entry.file_name());
            if excluded.iter().any(|skip| relative.starts_with(skip)) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                queue.push_back(relative.clone());
            }
            paths.push(relative);
        }
    }

    Ok(paths)
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
