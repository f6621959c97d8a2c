use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

#[cfg(test)]
mod tests;

#[derive(Parser, Debug)]
#[command(name = "patchswap")]
#[command(about = "Background update applier with locked-directory fallback", long_about = None)]
pub(crate) struct Cli {
    /// Updater config file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    install_root: Option<PathBuf>,
    #[arg(long, global = true)]
    update_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Stage a patch directory as the active update.
    Stage {
        #[arg(long)]
        name: String,
        #[arg(long)]
        patch_dir: PathBuf,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        build_id: Option<String>,
        #[arg(long)]
        app_version: Option<String>,
        #[arg(long)]
        channel_change: bool,
        #[arg(long)]
        sha256: Option<String>,
        #[arg(long)]
        signature: Option<String>,
    },
    /// Apply the active update.
    Apply {
        /// Re-run this command as a detached process and return at once.
        #[arg(long)]
        background: bool,
    },
    /// Wait until the apply phase has finished.
    Wait {
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Complete an applied update after the application relaunched.
    Finalize {
        /// Poll until the update is ready to finalize.
        #[arg(long)]
        wait: bool,
    },
    Status,
    /// Launch the configured application and supervise it.
    Relaunch,
    /// Report whether the install root is held, or hold it.
    ProbeLock {
        /// Hold the install root lock for this many milliseconds.
        #[arg(long)]
        hold_ms: Option<u64>,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,patchswap_applier=info,patchswap_cli=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    dispatch::run_cli(Cli::parse())
}
