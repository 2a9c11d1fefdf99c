use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::config::{RATE_LIMIT_WINDOW, RateLimiterConfig};

#[derive(Debug, Clone)]
pub(crate) struct LimiterState {
    request_count: u32,
    token_count: u64,
    window_started_at: Instant,
    error_count: u32,
    circuit_opened_at: Option<Instant>,
}

impl LimiterState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            token_count: 0,
            window_started_at: now,
            error_count: 0,
            circuit_opened_at: None,
        }
    }

    /// `Err` carries the remaining cooldown while the circuit is open. An
    /// elapsed cooldown closes the circuit and clears the error tally.
    pub(crate) fn check_circuit(
        &mut self,
        now: Instant,
        config: &RateLimiterConfig,
    ) -> Result<(), Duration> {
        let Some(opened_at) = self.circuit_opened_at else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(opened_at);
        let cooldown = config.circuit_breaker_cooldown();
        if elapsed >= cooldown {
            self.circuit_opened_at = None;
            self.error_count = 0;
            info!("llm circuit breaker closed after cooldown");
            return Ok(());
        }
        Err(cooldown.saturating_sub(elapsed))
    }

    pub(crate) fn roll_window_if_elapsed(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_started_at) >= RATE_LIMIT_WINDOW {
            self.window_started_at = now;
            self.request_count = 0;
            self.token_count = 0;
        }
    }

    /// How long the caller must wait for the window to reset, or `None` when
    /// the request fits. An empty window always admits, so a single estimate
    /// larger than the token cap is not parked for a full minute.
    pub(crate) fn window_wait(
        &self,
        now: Instant,
        estimated_tokens: u64,
        config: &RateLimiterConfig,
    ) -> Option<Duration> {
        if self.request_count == 0 {
            return None;
        }
        let requests_exhausted = self.request_count >= config.max_requests_per_minute;
        let tokens_exhausted =
            self.token_count.saturating_add(estimated_tokens) > config.max_tokens_per_minute;
        if !requests_exhausted && !tokens_exhausted {
            return None;
        }
        Some(self.window_remaining(now))
    }

    pub(crate) fn admit(&mut self, estimated_tokens: u64) {
        self.request_count = self.request_count.saturating_add(1);
        self.token_count = self.token_count.saturating_add(estimated_tokens);
    }

    pub(crate) fn record_success(&mut self) {
        self.error_count = self.error_count.saturating_sub(1);
    }

    pub(crate) fn record_error(&mut self, now: Instant, config: &RateLimiterConfig) {
        self.error_count = self.error_count.saturating_add(1);
        if self.circuit_opened_at.is_none()
            && self.error_count >= config.circuit_breaker_error_threshold
        {
            self.circuit_opened_at = Some(now);
            warn!(
                error_count = self.error_count,
                cooldown_seconds = config.circuit_breaker_cooldown_seconds,
                "llm circuit breaker opened"
            );
        }
    }

    pub(crate) fn force_reset_circuit(&mut self) {
        if self.circuit_opened_at.take().is_some() {
            info!("llm circuit breaker reset by operator");
        }
        self.error_count = 0;
    }

    pub(crate) fn snapshot(&self, now: Instant, config: &RateLimiterConfig) -> StatusSnapshot {
        let window_elapsed =
            now.saturating_duration_since(self.window_started_at) >= RATE_LIMIT_WINDOW;
        let (used_requests, used_tokens, window_resets_in) = if window_elapsed {
            (0, 0, Duration::ZERO)
        } else {
            (
                self.request_count,
                self.token_count,
                self.window_remaining(now),
            )
        };

        let circuit_resets_in = self.circuit_opened_at.and_then(|opened_at| {
            let remaining = config
                .circuit_breaker_cooldown()
                .saturating_sub(now.saturating_duration_since(opened_at));
            (!remaining.is_zero()).then_some(remaining)
        });

        StatusSnapshot {
            remaining_requests: config.max_requests_per_minute.saturating_sub(used_requests),
            remaining_tokens: config.max_tokens_per_minute.saturating_sub(used_tokens),
            error_count: self.error_count,
            circuit_resets_in,
            window_resets_in,
        }
    }

    fn window_remaining(&self, now: Instant) -> Duration {
        RATE_LIMIT_WINDOW.saturating_sub(now.saturating_duration_since(self.window_started_at))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusSnapshot {
    pub(crate) remaining_requests: u32,
    pub(crate) remaining_tokens: u64,
    pub(crate) error_count: u32,
    pub(crate) circuit_resets_in: Option<Duration>,
    pub(crate) window_resets_in: Duration,
}

pub(crate) fn duration_to_retry_after_seconds(duration: Duration) -> u64 {
    let seconds = duration.as_secs();
    if seconds == 0 {
        return 1;
    }
    if duration.subsec_nanos() > 0 {
        seconds.saturating_add(1)
    } else {
        seconds
    }
}
