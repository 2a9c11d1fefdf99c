use std::time::Duration;

use crate::config::ConfigError;
use crate::config_env::{parse_u32_env, parse_u64_env};

const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 60;
const DEFAULT_MAX_TOKENS_PER_MINUTE: u64 = 200_000;
const DEFAULT_CIRCUIT_BREAKER_ERROR_THRESHOLD: u32 = 5;
const DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECONDS: u64 = 60;

pub(crate) const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_requests_per_minute: u32,
    pub max_tokens_per_minute: u64,
    pub circuit_breaker_error_threshold: u32,
    pub circuit_breaker_cooldown_seconds: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_tokens_per_minute: DEFAULT_MAX_TOKENS_PER_MINUTE,
            circuit_breaker_error_threshold: DEFAULT_CIRCUIT_BREAKER_ERROR_THRESHOLD,
            circuit_breaker_cooldown_seconds: DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECONDS,
        }
    }
}

impl RateLimiterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.max_requests_per_minute = parse_u32_env(
            "LLM_RATE_LIMIT_MAX_REQUESTS_PER_MINUTE",
            config.max_requests_per_minute,
        )?;
        config.max_tokens_per_minute = parse_u64_env(
            "LLM_RATE_LIMIT_MAX_TOKENS_PER_MINUTE",
            config.max_tokens_per_minute,
        )?;
        config.circuit_breaker_error_threshold = parse_u32_env(
            "LLM_CIRCUIT_BREAKER_ERROR_THRESHOLD",
            config.circuit_breaker_error_threshold,
        )?;
        config.circuit_breaker_cooldown_seconds = parse_u64_env(
            "LLM_CIRCUIT_BREAKER_COOLDOWN_SECONDS",
            config.circuit_breaker_cooldown_seconds,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_minute == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_RATE_LIMIT_MAX_REQUESTS_PER_MINUTE must be greater than 0".to_string(),
            ));
        }
        if self.max_tokens_per_minute == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_RATE_LIMIT_MAX_TOKENS_PER_MINUTE must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_error_threshold == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_CIRCUIT_BREAKER_ERROR_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_cooldown_seconds == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_CIRCUIT_BREAKER_COOLDOWN_SECONDS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_seconds)
    }
}
