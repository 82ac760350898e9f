//! Retry with exponential backoff.
//!
//! [`retry_with_backoff`] drives any fallible async operation under a
//! [`RetryPolicy`]. Whether an error is retried is decided by the policy's
//! predicate alone. The default, [`default_retry_predicate`], reads the
//! error's `retryable` flag (its category default unless set explicitly);
//! a custom predicate replaces that check entirely.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;

use crate::errors::{ErrorCategory, RuntimeError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on a server-declared `Retry-After`.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Jitter spreads each delay uniformly across ±25%.
const JITTER_FRACTION: f64 = 0.25;

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Decides whether `error` on attempt `attempt` (1-based) should be retried.
pub type RetryPredicate = Arc<dyn Fn(&RuntimeError, u32) -> bool + Send + Sync>;

/// Backoff parameters.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub max_total_time: Option<Duration>,
    /// Overrides [`default_retry_predicate`] when set.
    pub retry_predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            max_total_time: Some(Duration::from_secs(120)),
            retry_predicate: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("max_total_time", &self.max_total_time)
            .field("retry_predicate", &self.retry_predicate.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Shallow-merge `overrides` on top of this policy.
    pub fn merged(&self, overrides: &RetryOverride) -> Self {
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            initial_delay: overrides
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.initial_delay),
            max_delay: overrides
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.max_delay),
            backoff_multiplier: overrides
                .backoff_multiplier
                .unwrap_or(self.backoff_multiplier),
            jitter: overrides.jitter.unwrap_or(self.jitter),
            max_total_time: overrides
                .max_total_time_ms
                .map(|ms| Some(Duration::from_millis(ms)))
                .unwrap_or(self.max_total_time),
            retry_predicate: overrides
                .retry_predicate
                .clone()
                .or_else(|| self.retry_predicate.clone()),
        }
    }

    fn should_retry(&self, error: &RuntimeError, attempt: u32) -> bool {
        match &self.retry_predicate {
            Some(predicate) => predicate(error, attempt),
            None => default_retry_predicate(error, attempt),
        }
    }
}

/// Per-call overrides; unset fields keep the base policy's value.
///
/// Deserializable so the same shape can appear in runtime configuration.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub max_total_time_ms: Option<u64>,
    #[serde(skip)]
    pub retry_predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOverride")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("max_total_time_ms", &self.max_total_time_ms)
            .finish_non_exhaustive()
    }
}

// ─── Predicate & Delay ───────────────────────────────────────────────────────

/// Category-driven retry decision.
///
/// Every category follows the error's `retryable` flag, so transport,
/// timeout, connection and rate-limit errors retry unless marked otherwise.
/// Execution errors additionally retry for 5xx-equivalent failures, even
/// when flagged non-retryable.
pub fn default_retry_predicate(error: &RuntimeError, _attempt: u32) -> bool {
    match error.category {
        ErrorCategory::Transport
        | ErrorCategory::Timeout
        | ErrorCategory::Connection
        | ErrorCategory::RateLimit => error.retryable,
        ErrorCategory::Execution => {
            error.retryable || error.status().is_some_and(|s| (500..600).contains(&s))
        }
        _ => error.retryable,
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `min(initial × multiplier^(attempt-1), max)`, optionally jittered by ±25%,
/// never negative.
pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base_ns = policy.initial_delay.as_nanos() as f64;
    let raw_ns = base_ns * policy.backoff_multiplier.powi(exponent);
    let capped_ns = raw_ns.min(policy.max_delay.as_nanos() as f64);

    let final_ns = if policy.jitter {
        let spread = capped_ns * JITTER_FRACTION;
        capped_ns + rand::thread_rng().gen_range(-1.0..=1.0) * spread
    } else {
        capped_ns
    };

    if final_ns.is_finite() && final_ns > 0.0 {
        Duration::from_nanos(final_ns.round() as u64)
    } else {
        Duration::ZERO
    }
}

// ─── Retry Loop ──────────────────────────────────────────────────────────────

/// Information handed to the retry observer before each sleep.
#[derive(Debug, Clone)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub error: &'a RuntimeError,
    pub delay: Duration,
}

/// Run `operation` until it succeeds, the policy gives up, or the total
/// time budget is spent. On permanent failure the last attempt's error is
/// returned unchanged.
pub async fn retry_with_backoff<T, F, Fut, N>(
    mut operation: F,
    policy: &RetryPolicy,
    mut on_retry: N,
) -> Result<T, RuntimeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
    N: FnMut(RetryNotice<'_>),
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= max_attempts || !policy.should_retry(&error, attempt) {
            return Err(error);
        }

        let mut delay = calculate_delay(attempt, policy);
        if let Some(retry_after) = error.retry_after {
            delay = delay.max(retry_after.min(MAX_RETRY_AFTER));
        }

        // The budget is checked before each sleep, so the final sleep may
        // end past it.
        if let Some(budget) = policy.max_total_time {
            if started.elapsed() >= budget {
                tracing::debug!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retry budget exhausted"
                );
                return Err(error);
            }
        }

        on_retry(RetryNotice {
            attempt,
            error: &error,
            delay,
        });
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            code = error.code,
            "retrying after failure"
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
