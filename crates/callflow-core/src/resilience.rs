//! Resilience primitives shared by the STT/TTS/LLM boundaries.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Blocks requests after repeated rate-limit failures.
///
/// Only rate-limit errors count toward the threshold; any success resets
/// the failure count and closes the breaker.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

#[derive(Default)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        let threshold = if threshold == 0 { 3 } else { threshold };
        let cooldown = if cooldown.is_zero() {
            Duration::from_secs(30)
        } else {
            cooldown
        };
        Self {
            state: Mutex::new(BreakerState::default()),
            threshold,
            cooldown,
        }
    }

    /// False while the breaker is open.
    pub fn allow(&self) -> bool {
        let state = self.state.lock();
        match state.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.open_until = None;
    }

    pub fn on_error(&self, err: &Error) {
        if !err.is_rate_limit() {
            return;
        }
        let mut state = self.state.lock();
        state.failures += 1;
        if state.failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}

/// Fixed-backoff retry for transient failures.
///
/// Aborts immediately when the cancellation token fires; by default every
/// non-cancellation error is retryable.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        let max_retries = if max_retries == 0 { 2 } else { max_retries };
        let backoff = if backoff.is_zero() {
            Duration::from_millis(200)
        } else {
            backoff
        };
        Self {
            max_retries,
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) if attempt >= self.max_retries => return Err(err),
                Err(_) => {
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
    }
}
