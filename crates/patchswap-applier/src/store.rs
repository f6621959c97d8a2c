use anyhow::{Context, Result};
use std::fs;
use std::io;

use patchswap_core::{UpdateError, UpdateManifestDocument, UpdateRecord};

use crate::fs_utils::write_file_durable;
use crate::UpdateLayout;

/// Loads the manifest document; a missing file is an empty document.
pub fn load_manifest(layout: &UpdateLayout) -> Result<UpdateManifestDocument> {
    let path = layout.manifest_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(UpdateManifestDocument::default());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read update manifest: {}", path.display()));
        }
    };

    UpdateManifestDocument::from_toml_str(&raw)
        .with_context(|| format!("failed parsing update manifest: {}", path.display()))
}

pub fn persist_manifest(layout: &UpdateLayout, document: &UpdateManifestDocument) -> Result<()> {
    let path = layout.manifest_path();
    let rendered = document.to_toml_string()?;
    write_file_durable(&path, rendered.as_bytes())
        .map_err(UpdateError::from_io)
        .with_context(|| format!("failed to write update manifest: {}", path.display()))?;
    Ok(())
}

pub fn load_active_record(layout: &UpdateLayout) -> Result<UpdateRecord> {
    load_manifest(layout)?
        .active
        .ok_or_else(|| UpdateError::NoActiveUpdate.into())
}

/// Replaces the active record, keeping history untouched.
pub fn persist_active_record(layout: &UpdateLayout, record: &UpdateRecord) -> Result<()> {
    let mut document = load_manifest(layout)?;
    document.active = Some(record.clone());
    persist_manifest(layout, &document)
}

/// Stores `record` as active, then moves it into history.
pub fn archive_record(layout: &UpdateLayout, record: &UpdateRecord) -> Result<()> {
    let mut document = load_manifest(layout)?;
    document.active = Some(record.clone());
    document.archive_active();
    persist_manifest(layout, &document)
}
