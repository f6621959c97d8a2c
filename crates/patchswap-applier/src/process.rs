use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use patchswap_core::UpdateError;

use crate::poll::{wait_until, CancelToken, RetryPolicy, WaitOutcome};

/// What to start when relaunching the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

pub trait ProcessHandle: Send {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> Result<Option<ProcessExit>>;
    fn kill(&mut self) -> Result<()>;

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.try_wait()?.is_none())
    }
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Spawns real child processes through `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdProcessLauncher;

impl ProcessLauncher for StdProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|err| {
            UpdateError::ProcessLaunchFailure(format!("{}: {err}", spec.program.display()))
        })?;
        tracing::info!(pid = child.id(), program = %spec.program.display(), "launched process");
        Ok(Box::new(ChildHandle(child)))
    }
}

struct ChildHandle(Child);

impl ProcessHandle for ChildHandle {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        let status = self
            .0
            .try_wait()
            .with_context(|| format!("failed polling process {}", self.0.id()))?;
        Ok(status.map(|status| ProcessExit {
            code: status.code(),
        }))
    }

    fn kill(&mut self) -> Result<()> {
        let pid = self.0.id();
        self.0
            .kill()
            .with_context(|| format!("failed to kill process {pid}"))?;
        // reap so no zombie is left behind
        let _ = self.0.wait();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchOutcome {
    Exited(ProcessExit),
    /// Still running at the deadline and killed.
    TimedOut,
    /// Cancelled by the caller and killed.
    Cancelled,
}

/// Waits for `handle` to exit, killing it on timeout or cancellation.
pub fn supervise(
    handle: &mut dyn ProcessHandle,
    poll: &RetryPolicy,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<RelaunchOutcome> {
    let policy = poll.with_timeout(timeout);
    match wait_until(&policy, cancel, || handle.try_wait())? {
        WaitOutcome::Ready(exit) => {
            tracing::info!(pid = handle.id(), code = ?exit.code, "relaunched process exited");
            Ok(RelaunchOutcome::Exited(exit))
        }
        WaitOutcome::TimedOut => {
            tracing::warn!(pid = handle.id(), ?timeout, "relaunched process timed out, killing");
            handle.kill()?;
            Ok(RelaunchOutcome::TimedOut)
        }
        WaitOutcome::Cancelled => {
            tracing::info!(pid = handle.id(), "relaunch cancelled, killing");
            handle.kill()?;
            Ok(RelaunchOutcome::Cancelled)
        }
    }
}
