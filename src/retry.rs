// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff around any fallible async operation.
//!
//! Every error is retried, whatever [`SyncError::is_retryable()`] says; the
//! classification is logged so operators can see which failures were
//! permanent. After the last attempt the original error propagates.
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Retry  Delay
//! -----  -----
//! 1      2s
//! 2      4s
//! 3      8s
//! ...
//! 9      512s
//! ```
//!
//! While a loop is past its first attempt, [`SyncState::is_retrying()`] reads
//! true. The flag is held by a guard, so it clears on success, exhaustion and
//! cancellation alike.

use crate::error::{BoxFuture, Result, SyncError};
use crate::state::{self, RetryingGuard, SyncState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Exponential base.
    pub base: f64,
    /// Scale of one backoff step (`unit * base^retry`).
    pub unit: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base: 2.0,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base: 2.0,
            unit: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
        }
    }

    /// Delay before retry `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let multiplier = self.base.powi(retry as i32);
        let delay_secs = self.unit.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

/// Runs operations under a [`RetryPolicy`], maintaining the shared retrying flag.
#[derive(Clone)]
pub struct RetryHelper {
    policy: RetryPolicy,
    state: Arc<SyncState>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetryHelper {
    pub fn new(policy: RetryPolicy, state: Arc<SyncState>) -> Self {
        Self {
            policy,
            state,
            cancel: None,
        }
    }

    /// Abort backoff sleeps when `cancel` turns true.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds or the attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = Attempts::new(self);
        loop {
            attempts.begin()?;
            match f().await {
                Ok(value) => {
                    attempts.succeeded(operation);
                    return Ok(value);
                }
                Err(e) => attempts.failed(operation, e).await?,
            }
        }
    }

    /// Like [`run`](Self::run), lending `target` mutably to every attempt
    /// (an [`EventSource`](crate::broker::EventSource) being polled, say).
    pub async fn run_on<S, T, F>(&self, operation: &str, target: &mut S, mut f: F) -> Result<T>
    where
        S: ?Sized,
        F: for<'t> FnMut(&'t mut S) -> BoxFuture<'t, T>,
    {
        let mut attempts = Attempts::new(self);
        loop {
            attempts.begin()?;
            match f(&mut *target).await {
                Ok(value) => {
                    attempts.succeeded(operation);
                    return Ok(value);
                }
                Err(e) => attempts.failed(operation, e).await?,
            }
        }
    }
}

/// Attempt bookkeeping of one retry loop.
struct Attempts<'a> {
    helper: &'a RetryHelper,
    cancel: Option<watch::Receiver<bool>>,
    retrying: Option<RetryingGuard<'a>>,
    attempt: u32,
}

impl<'a> Attempts<'a> {
    fn new(helper: &'a RetryHelper) -> Self {
        Self {
            helper,
            cancel: helper.cancel.clone(),
            retrying: None,
            attempt: 0,
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(state::is_cancelled) {
            return Err(SyncError::Cancelled);
        }
        self.attempt += 1;
        Ok(())
    }

    fn succeeded(&self, operation: &str) {
        if self.attempt > 1 {
            debug!(operation, attempt = self.attempt, "Operation succeeded after retry");
        }
    }

    /// Sleep out the backoff, or hand the error back when no attempt is left.
    async fn failed(&mut self, operation: &str, err: SyncError) -> Result<()> {
        if matches!(err, SyncError::Cancelled) {
            return Err(err);
        }

        let policy = &self.helper.policy;
        if self.attempt >= policy.max_attempts {
            error!(
                operation,
                attempts = self.attempt,
                retryable = err.is_retryable(),
                error = %err,
                "Retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay_for_retry(self.attempt);
        warn!(
            operation,
            attempt = self.attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            retryable = err.is_retryable(),
            error = %err,
            "Operation failed, retrying"
        );
        crate::metrics::record_retry(operation, err.kind());

        if self.retrying.is_none() {
            let helper: &'a RetryHelper = self.helper;
            self.retrying = Some(helper.state.begin_retry());
        }

        match self.cancel.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(()),
                    _ = state::cancelled(rx) => Err(SyncError::Cancelled),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}
