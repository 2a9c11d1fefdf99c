use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ConfigError, chat_completions_url};
use crate::lanes::ReasoningPolicy;
use crate::messages::{ChatMessage, MessageContent, ToolChoice, ToolDefinition};
use crate::tool_calls::ResponseToolCall;
use crate::usage::{Usage, UsagePayload};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const MODEL_HEADER: &str = "x-model";
pub const PROVIDER_HEADER: &str = "x-provider";
pub const FINGERPRINT_HEADER: &str = "x-system-fingerprint";

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Error reported by the upstream, either through a non-2xx status or an
/// `error` object inside a 200 body.
#[derive(Debug, Clone, Error)]
#[error("upstream error{}: {message}", status_label(.status))]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ApiError {
    fn from_failed_response(status: StatusCode, body: &str, request_id: Option<String>) -> Self {
        let details = serde_json::from_str::<Value>(body)
            .unwrap_or_else(|_| Value::String(body.to_string()));
        let message = error_message(&details).unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("http status {}", status.as_u16())
            } else {
                truncate_chars(trimmed, MAX_ERROR_MESSAGE_CHARS)
            }
        });

        Self {
            message,
            status: Some(status.as_u16()),
            request_id,
            details: Some(details),
        }
    }

    /// `None` unless the body carries a non-null `error` member.
    pub(crate) fn from_error_object(
        body: &Value,
        http_status: StatusCode,
        request_id: Option<String>,
    ) -> Option<Self> {
        let error = body.get("error").filter(|error| !error.is_null())?;
        let status = error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(http_status.as_u16());

        Some(Self {
            message: error_message(body)
                .unwrap_or_else(|| "upstream reported an error".to_string()),
            status: Some(status),
            request_id: request_id.or_else(|| string_field(body, "id")),
            details: Some(error.clone()),
        })
    }

    fn invalid_payload(message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            request_id,
            details: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("chat completion request was cancelled")]
    Cancelled,
    #[error("chat completion request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("chat completion transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ClientError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Api(err) => err.request_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl ResponseFormat {
    pub const fn json_object() -> Self {
        Self {
            kind: "json_object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct UsageAccounting {
    include: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Secondary fallback list the aggregator may walk on its own.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningPolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    usage: UsageAccounting,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            models: Vec::new(),
            temperature: None,
            max_tokens: None,
            response_format: None,
            reasoning: None,
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            usage: UsageAccounting { include: true },
        }
    }

    pub fn with_fallback_models(mut self, fallback_models: &[String]) -> Self {
        self.models = fallback_models.to_vec();
        self
    }
}

/// Per-call transport options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub base_url: Option<String>,
    pub cancel: Option<CancellationToken>,
}

/// Observability values read from response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub system_fingerprint: Option<String>,
}

impl ResponseMetadata {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            request_id: header_value(headers, REQUEST_ID_HEADER),
            model: header_value(headers, MODEL_HEADER),
            provider: header_value(headers, PROVIDER_HEADER),
            system_fingerprint: header_value(headers, FINGERPRINT_HEADER),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub system_fingerprint: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
    #[serde(skip)]
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<CompletionMessage>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ResponseToolCall>>,
}

impl ChatCompletionResponse {
    /// Plain text of the first choice, from `message.content` or legacy `text`.
    pub fn first_choice_text(&self) -> String {
        let Some(choice) = self.choices.first() else {
            return String::new();
        };
        choice
            .message
            .as_ref()
            .and_then(|message| message.content.as_ref())
            .map(MessageContent::to_plain_text)
            .filter(|text| !text.is_empty())
            .or_else(|| choice.text.clone())
            .unwrap_or_default()
    }

    pub fn first_choice_tool_calls(&self) -> Vec<ResponseToolCall> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.tool_calls.clone())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage.as_ref().map(UsagePayload::normalize)
    }

    /// Body value first, then the matching response header.
    pub fn resolved_model(&self) -> Option<&str> {
        non_empty(self.model.as_deref()).or(self.metadata.model.as_deref())
    }

    pub fn resolved_provider(&self) -> Option<&str> {
        non_empty(self.provider.as_deref()).or(self.metadata.provider.as_deref())
    }

    pub fn resolved_request_id(&self) -> Option<&str> {
        self.metadata
            .request_id
            .as_deref()
            .or(non_empty(self.id.as_deref()))
    }

    pub fn resolved_fingerprint(&self) -> Option<&str> {
        non_empty(self.system_fingerprint.as_deref())
            .or(self.metadata.system_fingerprint.as_deref())
    }
}

/// A stream whose headers arrived with a 2xx status. The body is decoded by
/// the caller.
#[derive(Debug)]
pub struct RawEventStream {
    pub metadata: ResponseMetadata,
    pub response: reqwest::Response,
}

#[derive(Clone)]
pub struct ChatCompletionClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ChatCompletionClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Effective timeout for one call: the per-call override or the client default.
    pub fn call_timeout(&self, options: &CallOptions) -> Duration {
        options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms))
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        options: &CallOptions,
    ) -> Result<ChatCompletionResponse, ClientError> {
        self.guarded(options, async {
            let response = self.send(request, options, false).await?;
            let status = response.status();
            let metadata = ResponseMetadata::from_headers(response.headers());
            let body = response
                .text()
                .await
                .map_err(|err| ClientError::Transport(format!("response body read failed: {err}")))?;

            if !status.is_success() {
                return Err(ApiError::from_failed_response(
                    status,
                    &body,
                    metadata.request_id.clone(),
                )
                .into());
            }

            let value = serde_json::from_str::<Value>(&body).map_err(|_| {
                ApiError::invalid_payload(
                    "response body is not valid json",
                    metadata.request_id.clone(),
                )
            })?;
            if let Some(err) =
                ApiError::from_error_object(&value, status, metadata.request_id.clone())
            {
                return Err(err.into());
            }

            let mut parsed = serde_json::from_value::<ChatCompletionResponse>(value).map_err(
                |err| {
                    ApiError::invalid_payload(
                        format!("unexpected response shape: {err}"),
                        metadata.request_id.clone(),
                    )
                },
            )?;
            parsed.metadata = metadata;
            Ok::<_, ClientError>(parsed)
        })
        .await
    }

    /// Sends a streaming request and returns once response headers arrive.
    /// The timeout here covers establishment; the decoder enforces the rest
    /// of [`call_timeout`](Self::call_timeout).
    pub async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
        options: &CallOptions,
    ) -> Result<RawEventStream, ClientError> {
        self.guarded(options, async {
            let response = self.send(request, options, true).await?;
            let status = response.status();
            let metadata = ResponseMetadata::from_headers(response.headers());

            if !status.is_success() {
                let body = response.text().await.map_err(|err| {
                    ClientError::Transport(format!("response body read failed: {err}"))
                })?;
                return Err(
                    ApiError::from_failed_response(status, &body, metadata.request_id).into(),
                );
            }

            Ok::<_, ClientError>(RawEventStream { metadata, response })
        })
        .await
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        options: &CallOptions,
        stream: bool,
    ) -> Result<reqwest::Response, ClientError> {
        let base_url = options
            .base_url
            .as_deref()
            .unwrap_or(self.config.base_url.as_str());
        let url = chat_completions_url(base_url);

        debug!(
            model = %request.model,
            fallback_models = request.models.len(),
            stream,
            "sending chat completion request"
        );

        let mut builder = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .header(
                ACCEPT,
                if stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            );
        if let Some(app_url) = self.config.app_url.as_deref() {
            builder = builder.header("HTTP-Referer", app_url);
        }
        if let Some(app_title) = self.config.app_title.as_deref() {
            builder = builder.header("X-Title", app_title);
        }

        let body = if stream == request.stream {
            builder.json(request)
        } else {
            let mut streaming = request.clone();
            streaming.stream = stream;
            builder.json(&streaming)
        };

        body.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }
            } else {
                ClientError::Transport(err.to_string())
            }
        })
    }

    /// Races `work` against the caller's cancellation token and the call
    /// timeout. Whichever loses is dropped, which releases its timer or waiter.
    async fn guarded<T, F>(&self, options: &CallOptions, work: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let timeout = self.call_timeout(options);
        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = tokio::time::timeout(timeout, work) => result.unwrap_or_else(|_| {
                Err(ClientError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }),
        }
    }
}

fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    match error {
        Value::String(message) => Some(message.clone()),
        Value::Object(_) => error
            .get("message")
            .and_then(Value::as_str)
            .map(|message| truncate_chars(message, MAX_ERROR_MESSAGE_CHARS)),
        _ => None,
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|status| format!(" (status {status})"))
        .unwrap_or_default()
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &value[..byte_index]),
        None => value.to_string(),
    }
}
