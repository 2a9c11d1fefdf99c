//! Process-wide admission control: a one-minute request/token budget plus an
//! error-triggered circuit breaker.
//!
//! A `RateLimiter` is a cheap handle; clones share one state. Construct it once
//! and pass it to every call site that should be gated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use state::{LimiterState, duration_to_retry_after_seconds};

mod config;
mod state;

pub use config::RateLimiterConfig;

use crate::config::ConfigError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("llm circuit breaker is open; retry in {retry_after_seconds}s")]
    CircuitOpen { retry_after_seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStatus {
    pub remaining_requests: u32,
    pub remaining_tokens: u64,
    pub circuit: CircuitState,
    pub error_count: u32,
    /// Cooldown left while the circuit is open.
    pub circuit_resets_in: Option<Duration>,
    pub window_resets_in: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(LimiterState::new(Instant::now()))),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(RateLimiterConfig::from_env()?)
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admits one request carrying `estimated_tokens`.
    ///
    /// An open circuit rejects immediately. An exhausted window parks only
    /// this caller until the window resets. Waiters are not coordinated, so
    /// many callers parked on the same window all wake together and can
    /// overshoot the fresh window's budget.
    ///
    /// An empty window always admits, even when `estimated_tokens` alone
    /// exceeds the per-minute token cap.
    pub async fn acquire(&self, estimated_tokens: u64) -> Result<(), RateLimitError> {
        let wait = {
            let mut state = self.lock_state();
            let now = Instant::now();
            state
                .check_circuit(now, &self.config)
                .map_err(|remaining| RateLimitError::CircuitOpen {
                    retry_after_seconds: duration_to_retry_after_seconds(remaining),
                })?;
            state.roll_window_if_elapsed(now);

            match state.window_wait(now, estimated_tokens, &self.config) {
                Some(wait) => wait,
                None => {
                    state.admit(estimated_tokens);
                    return Ok(());
                }
            }
        };

        debug!(
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            estimated_tokens, "llm rate limit window exhausted; waiting for reset"
        );
        tokio::time::sleep(wait).await;

        let mut state = self.lock_state();
        state.roll_window_if_elapsed(Instant::now());
        state.admit(estimated_tokens);
        Ok(())
    }

    pub fn record_success(&self) {
        self.lock_state().record_success();
    }

    pub fn record_error(&self) {
        self.lock_state().record_error(Instant::now(), &self.config);
    }

    pub fn force_reset_circuit(&self) {
        self.lock_state().force_reset_circuit();
    }

    pub fn status(&self) -> RateLimiterStatus {
        let snapshot = self.lock_state().snapshot(Instant::now(), &self.config);
        RateLimiterStatus {
            remaining_requests: snapshot.remaining_requests,
            remaining_tokens: snapshot.remaining_tokens,
            circuit: if snapshot.circuit_resets_in.is_some() {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            error_count: snapshot.error_count,
            circuit_resets_in: snapshot.circuit_resets_in,
            window_resets_in: snapshot.window_resets_in,
        }
    }

    /// Restores the freshly constructed state.
    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        *self.lock_state() = LimiterState::new(Instant::now());
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
