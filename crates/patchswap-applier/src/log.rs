use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use patchswap_core::{PatchAction, UpdateError};

use crate::fs_utils::remove_file_if_exists;
use crate::UpdateLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationOutcome {
    /// Written before a remove executes; never counts as completed.
    Started,
    Ok,
    Skipped,
    /// Completed by an earlier, interrupted attempt.
    Resumed,
    Failed,
}

impl OperationOutcome {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Ok | Self::Resumed)
    }
}

/// One JSON line of the application log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Attempt {
        attempt: u32,
        update: String,
        started_at_unix: u64,
        effective_root: String,
        used_alternate: bool,
    },
    Operation {
        seq: usize,
        action: PatchAction,
        path: String,
        outcome: OperationOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Finish {
        result: String,
    },
}

/// Operations an earlier attempt finished, keyed by position and path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedOperations {
    entries: HashSet<(usize, PatchAction, String)>,
    started: HashSet<(usize, PatchAction, String)>,
}

impl CompletedOperations {
    pub fn contains(&self, seq: usize, action: PatchAction, path: &str) -> bool {
        self.entries.contains(&(seq, action, path.to_string()))
    }

    /// True when an earlier attempt began the operation but logged no result.
    pub fn was_started(&self, seq: usize, action: PatchAction, path: &str) -> bool {
        self.started.contains(&(seq, action, path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-only log for one apply attempt. Every entry is flushed and synced
/// before `append` returns.
#[derive(Debug)]
pub struct ApplicationLog {
    path: PathBuf,
    file: File,
}

impl ApplicationLog {
    /// Rotates any previous log for `index` and opens a fresh one.
    pub fn begin_attempt(layout: &UpdateLayout, index: u32, header: LogEntry) -> Result<Self> {
        rotate_logs(layout, index)?;
        let path = layout.patch_log_path(index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open application log: {}", path.display()))?;
        let mut log = Self { path, file };
        log.append(&header)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let mut line =
            serde_json::to_vec(entry).context("failed to serialize application log entry")?;
        line.push(b'\n');
        let file = &mut self.file;
        let written = file
            .write_all(&line)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        written
            .map_err(UpdateError::from_io)
            .with_context(|| format!("failed to append application log: {}", self.path.display()))
    }
}

pub fn read_log_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read application log: {}", path.display()));
        }
    };

    // a crash can leave the final line torn; it never counts as completed
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
        .collect())
}

pub fn read_completed_operations(path: &Path) -> Result<CompletedOperations> {
    let mut completed = CompletedOperations::default();
    for entry in read_log_entries(path)? {
        if let LogEntry::Operation {
            seq,
            action,
            path,
            outcome,
            ..
        } = entry
        {
            let key = (seq, action, path);
            if outcome.is_completed() {
                completed.started.remove(&key);
                completed.entries.insert(key);
            } else if outcome == OperationOutcome::Started {
                completed.started.insert(key);
            } else {
                completed.started.remove(&key);
            }
        }
    }
    Ok(completed)
}

/// Shifts `update.log` to `last-update.log` and an existing last log to
/// `backup-update.log`, dropping the previous backup. Returns whether a
/// current log existed.
pub fn rotate_logs(layout: &UpdateLayout, index: u32) -> Result<bool> {
    let current = layout.patch_log_path(index);
    if !current.exists() {
        return Ok(false);
    }

    let last = layout.last_log_path();
    let backup = layout.backup_log_path();
    if last.exists() {
        remove_file_if_exists(&backup)
            .with_context(|| format!("failed to remove {}", backup.display()))?;
        fs::rename(&last, &backup).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                last.display(),
                backup.display()
            )
        })?;
    }
    fs::rename(&current, &last).with_context(|| {
        format!(
            "failed to rotate {} to {}",
            current.display(),
            last.display()
        )
    })?;
    tracing::debug!(log = %last.display(), "rotated application log");
    Ok(true)
}

pub fn remove_rotated_logs(layout: &UpdateLayout) -> Result<()> {
    for path in [layout.last_log_path(), layout.backup_log_path()] {
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}
