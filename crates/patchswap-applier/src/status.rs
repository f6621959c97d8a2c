use anyhow::{Context, Result};
use std::fs;
use std::io;

use patchswap_core::{UpdateError, UpdateState};

use crate::fs_utils::write_file_durable;
use crate::UpdateLayout;

/// Reads the single-line status record. A missing record is a typed
/// `StatusNotFound` error.
pub fn read_status(layout: &UpdateLayout) -> Result<UpdateState> {
    let path = layout.status_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UpdateError::StatusNotFound(path.display().to_string()).into());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read status record: {}", path.display()));
        }
    };

    let state = UpdateState::parse_status_token(&raw)
        .with_context(|| format!("failed parsing status record: {}", path.display()))?;
    Ok(state)
}

/// Like [`read_status`], but absence is `None`.
pub fn try_read_status(layout: &UpdateLayout) -> Result<Option<UpdateState>> {
    match read_status(layout) {
        Ok(state) => Ok(Some(state)),
        Err(err)
            if matches!(
                err.downcast_ref::<UpdateError>(),
                Some(UpdateError::StatusNotFound(_))
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

pub fn write_status(layout: &UpdateLayout, state: UpdateState) -> Result<()> {
    let path = layout.status_path();
    write_file_durable(&path, format!("{}\n", state.as_status_token()).as_bytes())
        .map_err(UpdateError::from_io)
        .with_context(|| format!("failed to write status record: {}", path.display()))?;
    tracing::debug!(status = %state, path = %path.display(), "status record written");
    Ok(())
}
