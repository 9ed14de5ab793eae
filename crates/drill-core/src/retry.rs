//! Retry policy for calls to rate-limited, latency-variable services.
//!
//! A [`RetryPolicy`] classifies each failure, decides whether to try again and
//! how long to wait. The decision core ([`RetryPolicy::decide`]) is shared by
//! two adapters: [`RetryPolicy::run`] for async call sites and
//! [`RetryPolicy::run_blocking`] for synchronous ones. Both take the request
//! itself so the policy's default timeout is always applied before the first
//! attempt.
//!
//! Delay for attempt `n` (1-indexed) is the provider's retry-after hint when
//! present, otherwise `min(base * 2^(n-1), max) * uniform(0.5, 1.0)`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use drill_llm::{CompletionRequest, LlmError};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;

// ============================================================================
// Classification
// ============================================================================

/// How a failed call failed, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The service asked us to slow down.
    RateLimited,
    /// The call did not finish in time.
    Timeout,
    /// Connection-level failure.
    Transport,
    /// The service answered with this HTTP status.
    Status(u16),
    /// Retrying cannot help (bad input, decode failure, cancellation).
    Permanent,
}

/// An error the retry policy knows how to classify.
pub trait Retryable: Sized {
    /// Classifies the failure.
    fn failure_kind(&self) -> FailureKind;

    /// Wait requested by the service, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// The error reported when the caller cancels.
    fn cancelled() -> Self;
}

impl Retryable for LlmError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Transport(_) | Self::Stream(_) => FailureKind::Transport,
            Self::Status { status, .. } => FailureKind::Status(*status),
            Self::Decode(_) | Self::Config(_) | Self::Cancelled => FailureKind::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// A request that carries an optional timeout.
pub trait TimeoutSlot {
    /// The timeout the caller set, if any.
    fn timeout(&self) -> Option<Duration>;

    /// Sets the timeout.
    fn set_timeout(&mut self, timeout: Duration);
}

impl TimeoutSlot for CompletionRequest {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Return the error to the caller.
    GiveUp,
}

// ============================================================================
// Policy
// ============================================================================

/// Retry and backoff settings for one kind of call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Backoff base.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// HTTP statuses treated as transient.
    pub retryable_status: Vec<u16>,
    /// Timeout injected into requests that do not set one.
    pub default_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            retryable_status: config.retryable_status_codes.clone(),
            default_timeout: None,
        }
    }

    /// Returns a copy of this policy that injects `timeout` into requests.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Fills in the default timeout unless the caller already set one.
    fn prepare<R: TimeoutSlot>(&self, mut request: R) -> R {
        if let (None, Some(default)) = (request.timeout(), self.default_timeout) {
            request.set_timeout(default);
        }
        request
    }

    /// Returns `true` if a failure of this kind is worth retrying.
    #[must_use]
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Transport => true,
            FailureKind::Status(status) => self.retryable_status.contains(&status),
            FailureKind::Permanent => false,
        }
    }

    /// Exponential backoff for `attempt` (1-indexed) scaled by `jitter`.
    ///
    /// `jitter` is clamped to `0.0..=1.0`.
    #[must_use]
    pub fn backoff_with(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let uncapped = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = uncapped.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped * jitter.clamp(0.0, 1.0))
    }

    /// Exponential backoff for `attempt` with jitter drawn from `0.5..=1.0`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        self.backoff_with(attempt, jitter)
    }

    /// Decides what to do after `attempt` (1-indexed) failed with `err`.
    ///
    /// Emits one log record per failed attempt.
    pub fn decide<E>(&self, attempt: u32, err: &E) -> Decision
    where
        E: Retryable + Display,
    {
        let kind = err.failure_kind();
        if !self.is_retryable(kind) {
            warn!(attempt, classification = "non_retryable", kind = ?kind, error = %err, "Call failed");
            return Decision::GiveUp;
        }
        if attempt > self.max_retries {
            warn!(attempt, classification = "retryable", kind = ?kind, error = %err, "Call failed; retries exhausted");
            return Decision::GiveUp;
        }

        let delay = err.retry_after().unwrap_or_else(|| self.backoff(attempt));
        warn!(
            attempt,
            classification = "retryable",
            kind = ?kind,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Call failed; retrying"
        );
        Decision::Retry(delay)
    }

    /// Runs `call` with `request` until it succeeds, fails permanently, or
    /// retries run out.
    ///
    /// `request` gets the default timeout unless it sets its own; each attempt
    /// receives a copy. Cancelling `cancel` drops the in-flight call or the
    /// pending wait and returns [`Retryable::cancelled`].
    pub async fn run<R, T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        request: R,
        mut call: F,
    ) -> Result<T, E>
    where
        R: TimeoutSlot + Clone,
        E: Retryable + Display,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let request = self.prepare(request);
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(E::cancelled()),
                outcome = call(request.clone()) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    debug!(attempt, classification = "success", "Call succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.decide(attempt, &err) {
                Decision::GiveUp => return Err(err),
                Decision::Retry(delay) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(E::cancelled()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Blocking counterpart of [`RetryPolicy::run`]; waits with `thread::sleep`.
    ///
    /// Must not be called from an async task.
    pub fn run_blocking<R, T, E, F>(&self, request: R, mut call: F) -> Result<T, E>
    where
        R: TimeoutSlot,
        E: Retryable + Display,
        F: FnMut(&R) -> Result<T, E>,
    {
        let request = self.prepare(request);
        let mut attempt = 1;
        loop {
            match call(&request) {
                Ok(value) => {
                    debug!(attempt, classification = "success", "Call succeeded");
                    return Ok(value);
                }
                Err(err) => match self.decide(attempt, &err) {
                    Decision::GiveUp => return Err(err),
                    Decision::Retry(delay) => std::thread::sleep(delay),
                },
            }
            attempt += 1;
        }
    }
}
