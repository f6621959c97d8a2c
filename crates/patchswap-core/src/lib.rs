mod error;
mod ini;
mod manifest;
mod patch;
mod state;
mod version;

pub use error::{failure_code_for, UpdateError};
pub use ini::IniDocument;
pub use manifest::{
    PatchReference, TargetDirectoryResolution, UpdateManifestDocument, UpdateRecord,
    MANIFEST_HISTORY_LIMIT,
};
pub use patch::{
    validate_relative_path, PatchAction, PatchManifest, PatchOperation, PatchOperationSet,
    PatchOperationSpec,
};
pub use state::{FailureCode, UpdateState};
pub use version::is_older_version;
