use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use patchswap_applier::{
    ApplyOutcome, CancelToken, DirectoryLock, FinalState, FinalizeOutcome, LaunchSpec, LockProbe,
    PatchSource, ProcessHandle, ProcessLauncher, SentinelLockProbe, StageRequest, StdProcessLauncher,
    UpdateService, UpdaterConfig, WaitOutcome, RELAUNCH_ENV_UPDATE_ROOT,
};

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_apply_outcome_lines, format_finalize_outcome_lines,
    format_relaunch_outcome_line, format_status_lines, format_wait_outcome_line, print_lines,
    print_section, render_status_line, start_wait_spinner,
};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(*shell, &mut stdout);
    }

    let style = current_output_style();
    let mut config = resolve_config(
        cli.config.as_deref(),
        cli.install_root.clone(),
        cli.update_root.clone(),
        std::env::var_os(RELAUNCH_ENV_UPDATE_ROOT).map(PathBuf::from),
    )?;
    if let Commands::Wait {
        timeout_ms: Some(timeout_ms),
    } = &cli.command
    {
        config.poll.timeout_ms = *timeout_ms;
    }
    let service = UpdateService::new(config);

    match cli.command {
        Commands::Stage {
            name,
            patch_dir,
            channel,
            build_id,
            app_version,
            channel_change,
            sha256,
            signature,
        } => {
            let record = service.stage_update(StageRequest {
                channel,
                build_id,
                app_version,
                channel_change,
                sha256,
                signature,
                ..StageRequest::new(name, PatchSource::Directory(patch_dir))
            })?;
            println!(
                "{}",
                render_status_line(
                    style,
                    "ok",
                    &format!(
                        "staged {} as updates/{} (status={})",
                        record.name, record.patch.index, record.state
                    )
                )
            );
        }
        Commands::Apply { background: true } => {
            let exe = std::env::current_exe().context("failed to resolve current executable")?;
            let args = detached_apply_args(
                cli.config.as_deref(),
                &service.config().install_root,
                service.config().update_root.as_deref(),
            );
            let handle = StdProcessLauncher.launch(&LaunchSpec::new(exe).args(args))?;
            println!(
                "{}",
                render_status_line(
                    style,
                    "step",
                    &format!("apply running in background (pid={})", handle.id())
                )
            );
        }
        Commands::Apply { background: false } => {
            let outcome = service.apply()?;
            print_lines(&format_apply_outcome_lines(&outcome, style));
            if let ApplyOutcome::Failed { code, .. } = outcome {
                bail!("update apply failed with code {code}");
            }
        }
        Commands::Wait { .. } => {
            let spinner = start_wait_spinner(style, "waiting for apply");
            let outcome = service.wait_for_apply(&CancelToken::new());
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            let outcome = outcome?;
            println!(
                "{}",
                format_wait_outcome_line(&outcome, style, |state| {
                    format!("apply finished (status={state})")
                })
            );
            if outcome == WaitOutcome::TimedOut {
                bail!("timed out waiting for apply to finish");
            }
        }
        Commands::Finalize { wait } => {
            let outcome = if wait {
                let spinner = start_wait_spinner(style, "waiting to finalize");
                let waited = service.finalize_when_ready(&CancelToken::new());
                if let Some(spinner) = spinner {
                    spinner.finish_and_clear();
                }
                match waited? {
                    WaitOutcome::Ready(outcome) => outcome,
                    WaitOutcome::TimedOut => bail!("timed out waiting to finalize update"),
                    WaitOutcome::Cancelled => bail!("finalize wait cancelled"),
                }
            } else {
                service.finalize_after_relaunch()?
            };
            print_lines(&format_finalize_outcome_lines(&outcome, style));
            if let FinalizeOutcome::Finalized(FinalState::Failed(code)) = outcome {
                bail!("update finalize failed with code {code}");
            }
        }
        Commands::Status => {
            print_section(style, "update status");
            let state = service.current_state()?;
            let manifest = service.manifest()?;
            print_lines(&format_status_lines(state, &manifest, style));
        }
        Commands::Relaunch => {
            let outcome = service.relaunch(&CancelToken::new())?;
            println!("{}", format_relaunch_outcome_line(&outcome, style));
        }
        Commands::ProbeLock { hold_ms } => {
            let root = service.config().install_root.clone();
            let sentinel = service.config().platform.lock_sentinel.clone();
            match hold_ms {
                Some(hold_ms) => {
                    let lock = DirectoryLock::acquire(&root, &sentinel)?;
                    println!(
                        "{}",
                        render_status_line(
                            style,
                            "step",
                            &format!("holding {} for {hold_ms}ms", lock.path().display())
                        )
                    );
                    thread::sleep(Duration::from_millis(hold_ms));
                    drop(lock);
                }
                None => {
                    let held = SentinelLockProbe::new(sentinel).is_held(&root)?;
                    let label = if held { "held" } else { "free" };
                    println!(
                        "{}",
                        render_status_line(
                            style,
                            "step",
                            &format!("{}: {label}", root.display())
                        )
                    );
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Builds the effective config: file first, then flags, then the relaunch
/// environment for a still-unset update root.
pub(crate) fn resolve_config(
    config_path: Option<&Path>,
    install_root: Option<PathBuf>,
    update_root: Option<PathBuf>,
    env_update_root: Option<PathBuf>,
) -> Result<UpdaterConfig> {
    let mut config = match config_path {
        Some(path) => UpdaterConfig::load(path)?,
        None => UpdaterConfig::default(),
    };
    if let Some(install_root) = install_root {
        config.install_root = install_root;
    }
    if let Some(update_root) = update_root {
        config.update_root = Some(update_root);
    } else if config.update_root.is_none() {
        config.update_root = env_update_root;
    }

    if config.install_root.as_os_str().is_empty() {
        bail!("no install root configured; pass --install-root or set install_root in --config");
    }
    Ok(config)
}

pub(crate) fn detached_apply_args(
    config_path: Option<&Path>,
    install_root: &Path,
    update_root: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.push("--install-root".to_string());
    args.push(install_root.display().to_string());
    if let Some(update_root) = update_root {
        args.push("--update-root".to_string());
        args.push(update_root.display().to_string());
    }
    args.push("apply".to_string());
    args
}
