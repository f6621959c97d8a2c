use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use patchswap_core::{UpdateError, UpdateState};

use crate::status::try_read_status;
use crate::UpdateLayout;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Exponential backoff with an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2,
            timeout_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.max(1))
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(Duration::from_millis(self.max_delay_ms.max(1)))
    }
}

/// Shared flag that stops a wait or a supervised relaunch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Calls `check` with growing delays until it yields a value, the policy
/// deadline passes, or `cancel` fires.
pub fn wait_until<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut check: impl FnMut() -> Result<Option<T>>,
) -> Result<WaitOutcome<T>> {
    let deadline = Instant::now() + policy.timeout();
    let mut delay = policy.initial_delay();

    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(value) = check()? {
            return Ok(WaitOutcome::Ready(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::TimedOut);
        }

        let wake_at = now + delay.min(deadline - now);
        while Instant::now() < wake_at {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            thread::sleep(SLEEP_SLICE.min(wake_at.saturating_duration_since(Instant::now())));
        }
        delay = policy.next_delay(delay);
    }
}

/// Polls the status record until `accept` matches it. A missing or
/// unparsable record counts as not ready yet.
pub fn wait_for_status(
    layout: &UpdateLayout,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    accept: impl Fn(UpdateState) -> bool,
) -> Result<WaitOutcome<UpdateState>> {
    wait_until(policy, cancel, || match try_read_status(layout) {
        Ok(Some(state)) if accept(state) => Ok(Some(state)),
        Ok(_) => Ok(None),
        Err(err) if matches!(
            err.downcast_ref::<UpdateError>(),
            Some(UpdateError::MalformedManifest(_))
        ) =>
        {
            tracing::debug!(error = %format!("{err:#}"), "status record not readable yet");
            Ok(None)
        }
        Err(err) => Err(err),
    })
}
