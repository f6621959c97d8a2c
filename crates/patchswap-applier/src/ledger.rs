use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use patchswap_core::UpdateError;

use crate::fs_utils::write_file_durable;

/// Writes every removed path once, one per line, each newline-terminated.
pub fn write_removal_ledger(path: &Path, removed: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut rendered = String::new();
    for entry in removed {
        if seen.insert(entry.as_str()) {
            rendered.push_str(entry);
            rendered.push('\n');
        }
    }

    write_file_durable(path, rendered.as_bytes())
        .map_err(UpdateError::from_io)
        .with_context(|| format!("failed to write removal ledger: {}", path.display()))?;
    Ok(())
}

pub fn read_removal_ledger(path: &Path) -> Result<Vec<String>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read removal ledger: {}", path.display()));
        }
    };

    Ok(raw
        .lines()
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}
