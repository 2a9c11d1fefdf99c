use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::config_env::{
    optional_trimmed_env, parse_bool_env, parse_list_env, parse_u64_env, require_non_empty_env,
};
use crate::lanes::Lane;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

const BASE_URL_ENV: &str = "OPENROUTER_BASE_URL";
const REQUEST_TIMEOUT_ENV: &str = "LLM_REQUEST_TIMEOUT_MS";
const GLOBAL_MODELS_ENV: &str = "LLM_DEFAULT_MODELS";
const TEXT_MODELS_ENV: &str = "LLM_TEXT_MODELS";
const JSON_MODELS_ENV: &str = "LLM_JSON_MODELS";
const TOOL_CALLING_MODELS_ENV: &str = "LLM_TOOL_CALLING_MODELS";
const EXACTO_TOOL_CALLING_ENV: &str = "LLM_EXACTO_TOOL_CALLING";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {key}: {value}")]
    ParseInt { key: String, value: String },
    #[error("invalid boolean in env var {key}: {value}")]
    ParseBool { key: String, value: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Static transport configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub app_url: Option<String>,
    pub app_title: Option<String>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            app_url: None,
            app_title: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = require_non_empty_env("OPENROUTER_API_KEY")?;
        let base_url =
            optional_trimmed_env(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        validate_base_url(&base_url)?;

        let timeout_ms = parse_u64_env(REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(format!(
                "{REQUEST_TIMEOUT_ENV} must be greater than 0"
            )));
        }

        Ok(Self {
            base_url,
            api_key,
            timeout_ms,
            app_url: optional_trimmed_env("OPENROUTER_APP_URL"),
            app_title: optional_trimmed_env("OPENROUTER_APP_TITLE"),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_url(&self.base_url)?;
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingVar("OPENROUTER_API_KEY".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings that may change while the process runs. They are re-read on every
/// resolution, never cached across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewaySettings {
    pub global_models: Vec<String>,
    pub text_models: Vec<String>,
    pub json_models: Vec<String>,
    pub tool_calling_models: Vec<String>,
    pub exacto_tool_calling: bool,
    pub request_timeout_ms: Option<u64>,
    pub base_url: Option<String>,
}

impl GatewaySettings {
    pub fn lane_models(&self, lane: Lane) -> &[String] {
        match lane {
            Lane::Text => &self.text_models,
            Lane::Json => &self.json_models,
            Lane::ToolCalling => &self.tool_calling_models,
        }
    }

    pub fn from_env() -> Self {
        let exacto_tool_calling =
            parse_bool_env(EXACTO_TOOL_CALLING_ENV, false).unwrap_or_else(|err| {
                warn!(error = %err, "ignoring invalid exacto tool calling flag");
                false
            });

        let request_timeout_ms = match parse_u64_env(REQUEST_TIMEOUT_ENV, 0) {
            Ok(0) => None,
            Ok(timeout_ms) => Some(timeout_ms),
            Err(err) => {
                warn!(error = %err, "ignoring invalid request timeout override");
                None
            }
        };

        let base_url = optional_trimmed_env(BASE_URL_ENV).and_then(|raw| {
            match validate_base_url(&raw) {
                Ok(()) => Some(raw),
                Err(err) => {
                    warn!(error = %err, "ignoring invalid base url override");
                    None
                }
            }
        });

        Self {
            global_models: parse_list_env(GLOBAL_MODELS_ENV),
            text_models: parse_list_env(TEXT_MODELS_ENV),
            json_models: parse_list_env(JSON_MODELS_ENV),
            tool_calling_models: parse_list_env(TOOL_CALLING_MODELS_ENV),
            exacto_tool_calling,
            request_timeout_ms,
            base_url,
        }
    }
}

pub trait SettingsSource: Send + Sync {
    fn load(&self) -> GatewaySettings;
}

impl SettingsSource for GatewaySettings {
    fn load(&self) -> GatewaySettings {
        self.clone()
    }
}

/// Reads [`GatewaySettings`] from the process environment on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsSource for EnvSettings {
    fn load(&self) -> GatewaySettings {
        GatewaySettings::from_env()
    }
}

pub(crate) fn validate_base_url(raw: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(raw).map_err(|err| {
        ConfigError::InvalidConfiguration(format!("{BASE_URL_ENV} is not a valid url: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidConfiguration(format!(
            "{BASE_URL_ENV} must start with http:// or https://"
        )));
    }
    Ok(())
}

pub(crate) fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}
