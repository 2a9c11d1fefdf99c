//! One logical LLM operation across an ordered list of candidate models.
//!
//! Non-streaming calls walk the candidates until one yields usable content.
//! Streaming calls walk them only until a stream is established; after the
//! first byte has been accepted, failures end the stream with an `error`
//! event instead of restarting it on another model.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{
    CallOptions, ChatCompletionClient, ChatCompletionRequest, ChatCompletionResponse, ClientError,
    ResponseFormat,
};
use crate::config::{EnvSettings, GatewaySettings, SettingsSource};
use crate::lanes::{CandidateModelList, Lane, ModelLaneResolver, reasoning_policy_for};
use crate::messages::{ChatMessage, ToolChoice, ToolDefinition};
use crate::observability::{CallTrace, UsageCallback, UsageReport, emit_usage};
use crate::reliability::{RateLimitError, RateLimiter};
use crate::stream::{StreamDeadline, StreamEvent, decode_event_stream};
use crate::tool_calls::{AssembledToolCall, retain_usable};
use crate::usage::Usage;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("llm call was cancelled")]
    Cancelled,
    #[error(transparent)]
    CircuitOpen(#[from] RateLimitError),
    #[error("model returned empty content")]
    EmptyContent,
    #[error("model returned invalid json: {0}")]
    InvalidJson(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("llm call failed after {attempts} attempt(s): {last_error}")]
    AttemptsExhausted {
        attempts: usize,
        last_error: Box<GatewayError>,
    },
    #[error("json payload did not match the expected type: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl GatewayError {
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Client(err) => err.is_cancellation(),
            _ => false,
        }
    }

    /// Local validation failures of otherwise successful responses.
    pub fn is_content_error(&self) -> bool {
        matches!(self, Self::EmptyContent | Self::InvalidJson(_))
    }
}

/// One logical operation. Build with [`LaneRequest::new`] and the `with_*`
/// methods.
#[derive(Clone)]
pub struct LaneRequest {
    pub lane: Lane,
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub fallback_models: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    /// JSON mode only: move to the next candidate when content is empty or
    /// does not parse.
    pub retry_on_parse_error: bool,
    pub cancel: Option<CancellationToken>,
    pub on_usage: Option<UsageCallback>,
}

impl LaneRequest {
    pub fn new(lane: Lane, messages: Vec<ChatMessage>) -> Self {
        Self {
            lane,
            messages,
            model: None,
            fallback_models: Vec::new(),
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            retry_on_parse_error: true,
            cancel: None,
            on_usage: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, tool_choice: Option<ToolChoice>) -> Self {
        self.tools = tools;
        self.tool_choice = tool_choice;
        self
    }

    pub fn without_parse_retry(mut self) -> Self {
        self.retry_on_parse_error = false;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_usage_callback(mut self, callback: UsageCallback) -> Self {
        self.on_usage = Some(callback);
        self
    }

    /// Admission estimate: a quarter token per prompt character plus the
    /// completion allowance.
    pub fn estimated_tokens(&self) -> u64 {
        let prompt_chars = self
            .messages
            .iter()
            .map(|message| message.plain_text().chars().count() as u64)
            .sum::<u64>();
        prompt_chars.div_ceil(4) + u64::from(self.max_tokens.unwrap_or(0))
    }
}

impl fmt::Debug for LaneRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneRequest")
            .field("lane", &self.lane)
            .field("messages", &self.messages.len())
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("max_tokens", &self.max_tokens)
            .field("tools", &self.tools.len())
            .field("retry_on_parse_error", &self.retry_on_parse_error)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<AssembledToolCall>,
    /// Model reported by the upstream, or the candidate that was asked.
    pub model: String,
    pub requested_model: String,
    pub provider: Option<String>,
    pub request_id: Option<String>,
    pub system_fingerprint: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub attempts: usize,
}

impl Completion {
    fn from_response(response: &ChatCompletionResponse, requested_model: &str, attempts: usize) -> Self {
        let tool_calls = response
            .first_choice_tool_calls()
            .into_iter()
            .map(AssembledToolCall::from)
            .collect();

        Self {
            text: response.first_choice_text(),
            tool_calls: retain_usable(tool_calls),
            model: response
                .resolved_model()
                .unwrap_or(requested_model)
                .to_string(),
            requested_model: requested_model.to_string(),
            provider: response.resolved_provider().map(ToString::to_string),
            request_id: response.resolved_request_id().map(ToString::to_string),
            system_fingerprint: response.resolved_fingerprint().map(ToString::to_string),
            finish_reason: response.finish_reason().map(ToString::to_string),
            usage: response.usage(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonCompletion {
    pub value: Value,
    pub completion: Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMode {
    Text,
    Json,
}

#[derive(Clone)]
pub struct LaneOrchestrator {
    client: ChatCompletionClient,
    resolver: ModelLaneResolver,
    settings: Arc<dyn SettingsSource>,
    rate_limiter: Option<RateLimiter>,
    max_attempts: usize,
}

impl LaneOrchestrator {
    /// Live settings come from the environment until replaced with
    /// [`with_settings`](Self::with_settings).
    pub fn new(client: ChatCompletionClient) -> Self {
        Self {
            client,
            resolver: ModelLaneResolver::default(),
            settings: Arc::new(EnvSettings),
            rate_limiter: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_settings(mut self, settings: impl SettingsSource + 'static) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_resolver(mut self, resolver: ModelLaneResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn resolve_candidates(
        &self,
        lane: Lane,
        model: Option<&str>,
        fallback_models: &[String],
    ) -> CandidateModelList {
        self.resolver
            .resolve(lane, model, fallback_models, &self.settings.load())
    }

    pub async fn complete_text(&self, request: &LaneRequest) -> Result<Completion, GatewayError> {
        self.run(request, ResponseMode::Text, |completion| {
            if completion.text.trim().is_empty() && completion.tool_calls.is_empty() {
                return Err(GatewayError::EmptyContent);
            }
            Ok(completion)
        })
        .await
    }

    pub async fn complete_json(&self, request: &LaneRequest) -> Result<JsonCompletion, GatewayError> {
        self.run(request, ResponseMode::Json, |completion| {
            let value = parse_json_content(&completion.text)?;
            Ok(JsonCompletion { value, completion })
        })
        .await
    }

    pub async fn complete_json_as<T>(&self, request: &LaneRequest) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
    {
        let completion = self.complete_json(request).await?;
        serde_json::from_value(completion.value).map_err(GatewayError::Deserialize)
    }

    /// Streams one operation as typed events. Exactly one terminal event
    /// (`done` or `error`) ends the stream unless it is cancelled, in which
    /// case it ends with no event at all.
    pub fn stream(&self, request: LaneRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let this = self.clone();
        async_stream::stream! {
            let settings = this.settings.load();
            let candidates = this.resolver.resolve(
                request.lane,
                request.model.as_deref(),
                &request.fallback_models,
                &settings,
            );
            let cancel = request.cancel.clone().unwrap_or_default();
            let options = call_options(&settings, &cancel);

            match this.admit(&request, &cancel).await {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => return,
                Err(err) => {
                    yield StreamEvent::Error { message: err.to_string() };
                    return;
                }
            }

            let attempts = candidates.len().min(this.max_attempts);
            let mut last_error = None;
            let mut established = None;
            for (index, model) in candidates.iter().take(attempts).enumerate() {
                let upstream_request = this.build_request(
                    &request,
                    ResponseMode::Text,
                    model,
                    candidates.remaining_after(index),
                );
                let started_at = Instant::now();
                let deadline = StreamDeadline::after(
                    tokio::time::Instant::now(),
                    this.client.call_timeout(&options),
                );
                match this.client.open_stream(&upstream_request, &options).await {
                    Ok(raw) => {
                        established = Some((model.to_string(), raw, started_at, deadline));
                        break;
                    }
                    Err(err) if err.is_cancellation() => return,
                    Err(err) => {
                        this.record_error();
                        log_attempt_failure(request.lane, model, index, attempts, &candidates, &err);
                        last_error = Some(GatewayError::Client(err));
                    }
                }
            }

            let Some((model, raw, started_at, deadline)) = established else {
                let err = exhausted(attempts, last_error);
                yield StreamEvent::Error { message: err.to_string() };
                return;
            };

            let mut events = Box::pin(decode_event_stream(
                raw.response.bytes_stream(),
                raw.metadata,
                cancel,
                deadline,
            ));
            while let Some(event) = events.next().await {
                match &event {
                    StreamEvent::Done(summary) => {
                        this.record_success();
                        if let Some(usage) = summary.usage {
                            let report = UsageReport::new(
                                CallTrace {
                                    lane: request.lane,
                                    model: summary.model.as_deref().unwrap_or(&model),
                                    provider: summary.provider.as_deref(),
                                    request_id: summary.request_id.as_deref(),
                                    latency: started_at.elapsed(),
                                    streamed: true,
                                },
                                usage,
                            );
                            emit_usage(&report, request.on_usage.as_ref());
                        }
                    }
                    StreamEvent::Error { message } => {
                        this.record_error();
                        warn!(lane = %request.lane, model = %model, error = %message, "llm stream failed mid-flight");
                    }
                    StreamEvent::Text { .. } | StreamEvent::ToolCall(_) => {}
                }
                yield event;
            }
        }
    }

    async fn run<T, F>(
        &self,
        request: &LaneRequest,
        mode: ResponseMode,
        accept: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Completion) -> Result<T, GatewayError>,
    {
        let settings = self.settings.load();
        let candidates = self.resolver.resolve(
            request.lane,
            request.model.as_deref(),
            &request.fallback_models,
            &settings,
        );
        let cancel = request.cancel.clone().unwrap_or_default();
        let options = call_options(&settings, &cancel);
        self.admit(request, &cancel).await?;

        let attempts = candidates.len().min(self.max_attempts);
        let mut last_error = None;
        for (index, model) in candidates.iter().take(attempts).enumerate() {
            let upstream_request =
                self.build_request(request, mode, model, candidates.remaining_after(index));
            let started_at = Instant::now();

            let outcome = match self.client.complete(&upstream_request, &options).await {
                Ok(response) => {
                    self.record_success();
                    let completion = Completion::from_response(&response, model, index + 1);
                    self.report_usage(request, &completion, started_at.elapsed());
                    accept(completion)
                }
                Err(err) if err.is_cancellation() => return Err(GatewayError::Cancelled),
                Err(err) => {
                    self.record_error();
                    Err(GatewayError::Client(err))
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if mode == ResponseMode::Json && err.is_content_error() && !request.retry_on_parse_error
            {
                return Err(exhausted(index + 1, Some(err)));
            }
            log_attempt_failure(request.lane, model, index, attempts, &candidates, &err);
            last_error = Some(err);
        }

        Err(exhausted(attempts, last_error))
    }

    fn build_request(
        &self,
        request: &LaneRequest,
        mode: ResponseMode,
        model: &str,
        fallback_models: &[String],
    ) -> ChatCompletionRequest {
        let mut upstream = ChatCompletionRequest::new(model, request.messages.clone())
            .with_fallback_models(fallback_models);
        upstream.temperature = request.temperature;
        upstream.max_tokens = request.max_tokens;
        upstream.reasoning = reasoning_policy_for(request.lane);
        upstream.tools = request.tools.clone();
        upstream.tool_choice = request.tool_choice.clone();
        if mode == ResponseMode::Json {
            upstream.response_format = Some(ResponseFormat::json_object());
        }
        upstream
    }

    async fn admit(
        &self,
        request: &LaneRequest,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let Some(limiter) = self.rate_limiter.as_ref() else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = limiter.acquire(request.estimated_tokens()) => result.map_err(GatewayError::from),
        }
    }

    fn report_usage(&self, request: &LaneRequest, completion: &Completion, latency: Duration) {
        let Some(usage) = completion.usage else {
            return;
        };
        let report = UsageReport::new(
            CallTrace {
                lane: request.lane,
                model: &completion.model,
                provider: completion.provider.as_deref(),
                request_id: completion.request_id.as_deref(),
                latency,
                streamed: false,
            },
            usage,
        );
        emit_usage(&report, request.on_usage.as_ref());
    }

    fn record_success(&self) {
        if let Some(limiter) = self.rate_limiter.as_ref() {
            limiter.record_success();
        }
    }

    fn record_error(&self) {
        if let Some(limiter) = self.rate_limiter.as_ref() {
            limiter.record_error();
        }
    }
}

/// Parses model output as JSON, tolerating one surrounding Markdown fence.
pub fn parse_json_content(raw: &str) -> Result<Value, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::EmptyContent);
    }
    let body = strip_code_fence(trimmed);
    if body.is_empty() {
        return Err(GatewayError::EmptyContent);
    }
    serde_json::from_str(body).map_err(|err| GatewayError::InvalidJson(err.to_string()))
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(inner) = raw
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return raw;
    };
    let inner = inner.trim_start();
    inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner)
        .trim()
}

fn call_options(settings: &GatewaySettings, cancel: &CancellationToken) -> CallOptions {
    CallOptions {
        timeout: settings.request_timeout_ms.map(Duration::from_millis),
        base_url: settings.base_url.clone(),
        cancel: Some(cancel.clone()),
    }
}

fn exhausted(attempts: usize, last_error: Option<GatewayError>) -> GatewayError {
    GatewayError::AttemptsExhausted {
        attempts,
        last_error: Box::new(last_error.unwrap_or(GatewayError::EmptyContent)),
    }
}

fn log_attempt_failure(
    lane: Lane,
    model: &str,
    index: usize,
    attempts: usize,
    candidates: &CandidateModelList,
    err: &dyn std::error::Error,
) {
    warn!(
        lane = %lane,
        model = %model,
        attempt = index + 1,
        max_attempts = attempts,
        error = %err,
        "llm attempt failed"
    );
    if index + 1 < attempts
        && let Some(next_model) = candidates.as_slice().get(index + 1)
    {
        info!(lane = %lane, from_model = %model, next_model = %next_model, "falling back to next candidate model");
    }
}
