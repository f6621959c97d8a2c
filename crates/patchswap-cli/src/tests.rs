use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use patchswap_applier::{ApplyOutcome, ApplyResult, FinalState, FinalizeOutcome, WaitOutcome};
use patchswap_core::{
    FailureCode, PatchReference, TargetDirectoryResolution, UpdateManifestDocument, UpdateRecord,
    UpdateState,
};

use crate::completion::write_completions_script;
use crate::dispatch::{detached_apply_args, resolve_config};
use crate::render::{
    format_apply_outcome_lines, format_finalize_outcome_lines, format_status_lines,
    format_wait_outcome_line, render_status_line, resolve_output_style, OutputStyle,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "patchswap-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

#[test]
fn stage_command_parses_metadata_flags() {
    let cli = Cli::try_parse_from([
        "patchswap",
        "--install-root",
        "/opt/app",
        "stage",
        "--name",
        "2.0.0",
        "--patch-dir",
        "/tmp/patch",
        "--app-version",
        "2.0.0",
        "--channel-change",
    ])
    .expect("stage must parse");

    assert_eq!(cli.install_root, Some(PathBuf::from("/opt/app")));
    match cli.command {
        Commands::Stage {
            name,
            patch_dir,
            app_version,
            channel_change,
            sha256,
            ..
        } => {
            assert_eq!(name, "2.0.0");
            assert_eq!(patch_dir, PathBuf::from("/tmp/patch"));
            assert_eq!(app_version.as_deref(), Some("2.0.0"));
            assert!(channel_change);
            assert!(sha256.is_none());
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_are_accepted_after_subcommand() {
    let cli = Cli::try_parse_from([
        "patchswap",
        "apply",
        "--background",
        "--install-root",
        "/opt/app",
        "--update-root",
        "/var/lib/app",
    ])
    .expect("apply must parse");
    assert!(matches!(cli.command, Commands::Apply { background: true }));
    assert_eq!(cli.update_root, Some(PathBuf::from("/var/lib/app")));
}

#[test]
fn finalize_wait_and_probe_hold_parse() {
    let cli = Cli::try_parse_from(["patchswap", "finalize", "--wait"]).expect("must parse");
    assert!(matches!(cli.command, Commands::Finalize { wait: true }));

    let cli = Cli::try_parse_from(["patchswap", "probe-lock", "--hold-ms", "250"])
        .expect("must parse");
    assert!(matches!(
        cli.command,
        Commands::ProbeLock {
            hold_ms: Some(250)
        }
    ));
}

#[test]
fn completions_reject_unknown_shell() {
    let err = Cli::try_parse_from(["patchswap", "completions", "tcsh"])
        .expect_err("unknown shell must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn completions_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must write completions");
    let script = String::from_utf8(output).expect("completions must be utf-8");
    assert!(script.contains("patchswap"));
    assert!(script.contains("finalize"));
}

#[test]
fn resolve_output_style_follows_stdout() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false, true), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "applied update"),
        "applied update"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "apply failed"),
        "[ERR] apply failed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "step", "status: pending"),
        "[..] status: pending"
    );
}

#[test]
fn apply_outcome_lines_report_counts_and_failures() {
    let applied = ApplyOutcome::Applied(ApplyResult {
        applied_count: 2,
        skipped_count: 1,
        resumed_count: 0,
        removed: vec!["a.txt".to_string()],
        log_path: PathBuf::from("/opt/app/updates/0/update.log"),
    });
    let lines = format_apply_outcome_lines(&applied, OutputStyle::Rich);
    assert_eq!(
        lines[0],
        "[OK] applied update: applied=2 skipped=1 resumed=0 removed=1"
    );
    assert!(lines[1].ends_with("update.log"));

    let failed = ApplyOutcome::Failed {
        code: FailureCode::LOCK_CONTENTION,
        message: "install root became held".to_string(),
    };
    assert_eq!(
        format_apply_outcome_lines(&failed, OutputStyle::Plain),
        vec!["apply failed (code=12): install root became held".to_string()]
    );
}

#[test]
fn finalize_outcome_lines_cover_waiting_states() {
    assert_eq!(
        format_finalize_outcome_lines(&FinalizeOutcome::NotReady(None), OutputStyle::Rich),
        vec!["[WARN] update not ready to finalize (status=none)".to_string()]
    );
    assert_eq!(
        format_finalize_outcome_lines(
            &FinalizeOutcome::Finalized(FinalState::Failed(FailureCode::MERGE_FAILURE)),
            OutputStyle::Rich
        ),
        vec!["[ERR] finalized update (status=failed: 15)".to_string()]
    );
    assert_eq!(
        format_wait_outcome_line(
            &WaitOutcome::Ready(UpdateState::Applied),
            OutputStyle::Plain,
            |state| format!("apply finished (status={state})")
        ),
        "apply finished (status=applied)"
    );
}

#[test]
fn status_lines_describe_active_update() {
    let mut record = UpdateRecord::new(
        "2.0.0",
        PatchReference {
            index: 0,
            sha256: None,
            signature: None,
        },
    );
    record.attempts = 1;
    record.state = UpdateState::Applied;
    record.resolution = Some(TargetDirectoryResolution::alternate("/opt/app.updated"));
    let manifest = UpdateManifestDocument {
        active: Some(record),
        history: Vec::new(),
    };

    let lines = format_status_lines(Some(UpdateState::Applied), &manifest, OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "status: applied".to_string(),
            "active: 2.0.0 (patch=updates/0 attempts=1)".to_string(),
            format!(
                "target: {} (alternate)",
                Path::new("/opt/app.updated").display()
            ),
        ]
    );
}

#[test]
fn resolve_config_requires_install_root() {
    let err = resolve_config(None, None, None, None).expect_err("install root is required");
    assert!(err.to_string().contains("no install root configured"));
}

#[test]
fn resolve_config_layers_file_flags_and_environment() {
    let dir = test_dir();
    let path = dir.join("patchswap.toml");
    fs::write(
        &path,
        "install_root = \"/opt/from-file\"\nrelaunch_timeout_ms = 900\n",
    )
    .expect("must write config");

    let config = resolve_config(
        Some(&path),
        None,
        None,
        Some(PathBuf::from("/var/lib/from-env")),
    )
    .expect("config must resolve");
    assert_eq!(config.install_root, PathBuf::from("/opt/from-file"));
    assert_eq!(config.update_root, Some(PathBuf::from("/var/lib/from-env")));
    assert_eq!(config.relaunch_timeout_ms, 900);

    let config = resolve_config(
        Some(&path),
        Some(PathBuf::from("/opt/from-flag")),
        Some(PathBuf::from("/var/lib/from-flag")),
        Some(PathBuf::from("/var/lib/from-env")),
    )
    .expect("config must resolve");
    assert_eq!(config.install_root, PathBuf::from("/opt/from-flag"));
    assert_eq!(config.update_root, Some(PathBuf::from("/var/lib/from-flag")));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn detached_apply_args_forward_roots() {
    assert_eq!(
        detached_apply_args(
            Some(Path::new("/etc/patchswap.toml")),
            Path::new("/opt/app"),
            None
        ),
        vec![
            "--config".to_string(),
            "/etc/patchswap.toml".to_string(),
            "--install-root".to_string(),
            "/opt/app".to_string(),
            "apply".to_string(),
        ]
    );
}
