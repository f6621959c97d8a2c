use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Add,
    Remove,
}

impl PatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// One entry of `patch.toml`. Added bytes live under `payload/<path>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchOperationSpec {
    pub action: PatchAction,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchManifest {
    #[serde(default)]
    pub operations: Vec<PatchOperationSpec>,
}

impl PatchManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input)
            .map_err(|err| UpdateError::MalformedManifest(err.to_string()))
            .context("failed to parse patch manifest")?;

        let mut seen = HashSet::new();
        for operation in &manifest.operations {
            validate_relative_path(&operation.path)?;
            if !seen.insert((operation.action, operation.path.clone())) {
                return Err(UpdateError::MalformedManifest(format!(
                    "duplicate {} operation for '{}'",
                    operation.action.as_str(),
                    operation.path
                ))
                .into());
            }
        }
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize patch manifest")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    Add { path: String, bytes: Vec<u8> },
    Remove { path: String },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::Add {
            path: path.into(),
            bytes: bytes.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn action(&self) -> PatchAction {
        match self {
            Self::Add { .. } => PatchAction::Add,
            Self::Remove { .. } => PatchAction::Remove,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Ordered file operations applied against a single root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOperationSet {
    operations: Vec<PatchOperation>,
}

impl PatchOperationSet {
    pub fn new(operations: Vec<PatchOperation>) -> anyhow::Result<Self> {
        for operation in &operations {
            validate_relative_path(operation.path())?;
        }
        Ok(Self { operations })
    }

    /// Reads `patch.toml` and the payload bytes of a patch directory.
    pub fn load_from_dir(patch_dir: &Path) -> anyhow::Result<Self> {
        let manifest_path = patch_dir.join("patch.toml");
        let raw = fs::read_to_string(&manifest_path).with_context(|| {
            format!("failed to read patch manifest: {}", manifest_path.display())
        })?;
        let manifest = PatchManifest::from_toml_str(&raw)
            .with_context(|| format!("invalid patch manifest: {}", manifest_path.display()))?;

        let payload_root = patch_dir.join("payload");
        let mut operations = Vec::with_capacity(manifest.operations.len());
        for spec in manifest.operations {
            let operation = match spec.action {
                PatchAction::Add => {
                    let source = payload_root.join(&spec.path);
                    let bytes = fs::read(&source).with_context(|| {
                        format!(
                            "payload for added file '{}' is missing: {}",
                            spec.path,
                            source.display()
                        )
                    })?;
                    PatchOperation::Add {
                        path: spec.path,
                        bytes,
                    }
                }
                PatchAction::Remove => PatchOperation::Remove { path: spec.path },
            };
            operations.push(operation);
        }
        Ok(Self { operations })
    }

    /// Writes the set out as a patch directory readable by `load_from_dir`.
    pub fn write_to_dir(&self, patch_dir: &Path) -> anyhow::Result<()> {
        let payload_root = patch_dir.join("payload");
        fs::create_dir_all(&payload_root)
            .with_context(|| format!("failed to create {}", payload_root.display()))?;

        for operation in &self.operations {
            if let PatchOperation::Add { path, bytes } = operation {
                let dst = payload_root.join(path);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::write(&dst, bytes)
                    .with_context(|| format!("failed to write payload {}", dst.display()))?;
            }
        }

        let manifest_path = patch_dir.join("patch.toml");
        fs::write(&manifest_path, self.manifest().to_toml_string()?)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;
        Ok(())
    }

    pub fn manifest(&self) -> PatchManifest {
        PatchManifest {
            operations: self
                .operations
                .iter()
                .map(|operation| PatchOperationSpec {
                    action: operation.action(),
                    path: operation.path().to_string(),
                })
                .collect(),
        }
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Bytes covered by the payload digest: the manifest followed by each
    /// added file in operation order.
    pub fn digest_input(&self) -> anyhow::Result<Vec<u8>> {
        let mut input = self.manifest().to_toml_string()?.into_bytes();
        for operation in &self.operations {
            if let PatchOperation::Add { bytes, .. } = operation {
                input.extend_from_slice(bytes);
            }
        }
        Ok(input)
    }
}

/// Rejects paths that are empty, absolute, escape the target root, or carry
/// `.` or empty segments.
pub fn validate_relative_path(path: &str) -> anyhow::Result<()> {
    if path.trim().is_empty() {
        return Err(
            UpdateError::MalformedManifest("patch path must not be empty".to_string()).into(),
        );
    }
    if path.contains('\\') {
        return Err(UpdateError::MalformedManifest(format!(
            "patch path must use '/' separators: {path}"
        ))
        .into());
    }

    // only the canonical `a/b/c` form; ledger entries and reserved-path
    // checks compare these strings as written
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(UpdateError::MalformedManifest(format!(
            "patch path must be a plain relative path: {path}"
        ))
        .into());
    }

    let candidate = Path::new(path);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(UpdateError::MalformedManifest(format!(
                    "patch path must stay inside the target root: {path}"
                ))
                .into());
            }
        }
    }
    Ok(())
}
