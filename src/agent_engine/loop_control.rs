// Loop limits, per-stage retry policy and the pause gate.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::state::{Factors, RunStatus};
use crate::errors::{PilotError, PilotResult};

/// Invalid frames per run after which the environment counts as stuck.
pub const MAX_INVALID_SCREENSHOTS: u32 = 10;

/// Retryable pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Screenshot,
    Model,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Screenshot => "screenshot",
            Stage::Model => "model",
            Stage::Execute => "execute",
        };
        f.write_str(s)
    }
}

/// Called before each retry with the failed attempt's error and the retry number (1-based).
pub type RetryHook = Arc<dyn Fn(Stage, &PilotError, u32) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub on_retry: Option<RetryHook>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn on_retry(mut self, hook: impl Fn(Stage, &PilotError, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageRetries {
    pub screenshot: RetryPolicy,
    pub model: RetryPolicy,
    pub execute: RetryPolicy,
}

impl StageRetries {
    pub fn for_stage(&self, stage: Stage) -> &RetryPolicy {
        match stage {
            Stage::Screenshot => &self.screenshot,
            Stage::Model => &self.model,
            Stage::Execute => &self.execute,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_loop_count: u32,
    pub loop_interval: Duration,
    pub max_image_length: usize,
    pub factors: Factors,
    pub invalid_screenshot_backoff: Duration,
    pub retry: StageRetries,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_loop_count: 25,
            loop_interval: Duration::ZERO,
            max_image_length: 5,
            factors: Factors::default(),
            invalid_screenshot_backoff: Duration::from_millis(500),
            retry: StageRetries::default(),
        }
    }
}

/// Run `op` under `policy`, sequentially, racing each attempt against `cancel`.
///
/// Cancellation (observed or returned by `op`) bails out immediately without
/// consuming the remaining retries.
pub async fn run_stage<T, F, Fut>(
    stage: Stage,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> PilotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PilotResult<T>>,
{
    let mut retries = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PilotError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PilotError::Cancelled),
            r = op() => r,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_cancelled() {
            tracing::debug!(%stage, "stage aborted");
            return Err(err);
        }
        if retries >= policy.max_retries {
            tracing::warn!(%stage, retries, error = %err, "stage retries exhausted");
            return Err(err);
        }

        retries += 1;
        tracing::warn!(%stage, retry = retries, max = policy.max_retries, error = %err, "stage failed, retrying");
        if let Some(hook) = &policy.on_retry {
            hook(stage, &err, retries);
        }

        if !policy.backoff.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }
}

/// Iteration and invalid-frame accounting for one run.
pub struct LoopController {
    max_loop_count: u32,
    loop_count: u32,
    invalid_screenshots: u32,
}

impl LoopController {
    pub fn new(max_loop_count: u32) -> Self {
        Self {
            max_loop_count,
            loop_count: 0,
            invalid_screenshots: 0,
        }
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn invalid_screenshots(&self) -> u32 {
        self.invalid_screenshots
    }

    pub fn record_iteration(&mut self) {
        self.loop_count += 1;
    }

    pub fn record_invalid_screenshot(&mut self) {
        self.invalid_screenshots += 1;
    }

    /// `Some(MaxLoop)` once either budget is spent.
    pub fn should_stop(&self) -> Option<RunStatus> {
        if self.loop_count >= self.max_loop_count || self.invalid_screenshots >= MAX_INVALID_SCREENSHOTS {
            Some(RunStatus::MaxLoop)
        } else {
            None
        }
    }
}

/// Single-slot pause signal shared between the run and its handles.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until resumed. Returns `false` if `cancel` fired first.
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            r = rx.wait_for(|paused| !*paused) => r.is_ok(),
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
