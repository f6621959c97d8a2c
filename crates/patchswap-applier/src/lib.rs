mod apply;
mod finalize;
mod fs_utils;
mod layout;
mod ledger;
mod lock;
mod log;
mod merge;
mod platform;
mod poll;
mod process;
mod resolve;
mod service;
mod status;
mod store;

pub use apply::{
    apply_active_update, is_superseded_by_installed, verify_integrity, ApplyOutcome, ApplyResult,
    PatchEngine,
};
pub use finalize::{FinalState, FinalizeOutcome, RelaunchCoordinator};
pub use fs_utils::copy_tree_excluding;
pub use layout::UpdateLayout;
pub use ledger::{read_removal_ledger, write_removal_ledger};
pub use lock::{DirectoryLock, LockProbe, SentinelLockProbe};
pub use log::{
    read_completed_operations, read_log_entries, remove_rotated_logs, rotate_logs,
    ApplicationLog, CompletedOperations, LogEntry, OperationOutcome,
};
pub use merge::{merge_alternate_into, MergeSummary};
pub use platform::PlatformCapabilities;
pub use poll::{wait_for_status, wait_until, CancelToken, RetryPolicy, WaitOutcome};
pub use process::{
    supervise, LaunchSpec, ProcessExit, ProcessHandle, ProcessLauncher, RelaunchOutcome,
    StdProcessLauncher,
};
pub use resolve::resolve_target;
pub use service::{
    BackgroundApply, PatchSource, StageRequest, UpdateService, UpdaterConfig,
    RELAUNCH_ENV_MARKER, RELAUNCH_ENV_UPDATE_ROOT,
};
pub use status::{read_status, try_read_status, write_status};
pub use store::{
    archive_record, load_active_record, load_manifest, persist_active_record, persist_manifest,
};
