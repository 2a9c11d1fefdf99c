use futures::{StreamExt, pin_mut};
use llm_gateway::{
    ChatCompletionClient, ChatMessage, ClientConfig, ConfigError, EnvSettings, GatewayError,
    GatewaySettings, Lane, LaneOrchestrator, LaneRequest, ModelLaneResolver, RateLimiter,
    StreamEvent, estimate_for_counts,
};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{CompleteArgs, EstimateArgs, ModelSelection};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("stream ended with error: {0}")]
    Stream(String),
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

pub fn resolve(selection: &ModelSelection) -> Result<(), CommandError> {
    let settings = GatewaySettings::from_env();
    let candidates = ModelLaneResolver::default().resolve(
        selection.lane,
        selection.model.as_deref(),
        &selection.fallbacks,
        &settings,
    );

    let output = json!({
        "lane": selection.lane,
        "exacto_tool_calling": settings.exacto_tool_calling,
        "candidates": candidates.as_slice(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub fn estimate(args: &EstimateArgs) -> Result<(), CommandError> {
    if args.counts.is_empty() {
        warn!(workload = %args.workload, "no entity counts given; estimating an empty workload");
    }
    let estimate = estimate_for_counts(args.workload, args.counts.iter().cloned(), &args.model);
    println!("{}", serde_json::to_string_pretty(&estimate)?);
    Ok(())
}

pub async fn complete(args: &CompleteArgs) -> Result<(), CommandError> {
    let client = ChatCompletionClient::new(ClientConfig::from_env()?)?;
    let orchestrator = LaneOrchestrator::new(client)
        .with_settings(EnvSettings)
        .with_rate_limiter(RateLimiter::from_env()?);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling request");
            ctrl_c_cancel.cancel();
        }
    });

    let request = build_request(args, cancel);
    info!(lane = %args.selection.lane, stream = args.stream, "sending completion request");

    if args.stream {
        return stream_completion(&orchestrator, request).await;
    }

    match args.selection.lane {
        Lane::Json => {
            let completion = orchestrator.complete_json(&request).await?;
            println!("{}", serde_json::to_string_pretty(&completion.value)?);
            info!(
                model = %completion.completion.model,
                attempts = completion.completion.attempts,
                "json completion finished"
            );
        }
        Lane::Text | Lane::ToolCalling => {
            let completion = orchestrator.complete_text(&request).await?;
            if completion.tool_calls.is_empty() {
                println!("{}", completion.text);
            } else {
                println!("{}", serde_json::to_string_pretty(&completion)?);
            }
            info!(
                model = %completion.model,
                attempts = completion.attempts,
                "completion finished"
            );
        }
    }
    Ok(())
}

async fn stream_completion(
    orchestrator: &LaneOrchestrator,
    request: LaneRequest,
) -> Result<(), CommandError> {
    let events = orchestrator.stream(request);
    pin_mut!(events);

    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        if let StreamEvent::Error { message } = event {
            return Err(CommandError::Stream(message));
        }
    }
    Ok(())
}

fn build_request(args: &CompleteArgs, cancel: CancellationToken) -> LaneRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = args.system.as_deref() {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(args.prompt.as_str()));

    let mut request = LaneRequest::new(args.selection.lane, messages)
        .with_fallback_models(args.selection.fallbacks.clone())
        .with_cancellation(cancel);
    if let Some(model) = args.selection.model.as_deref() {
        request = request.with_model(model);
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = args.temperature {
        request = request.with_temperature(temperature);
    }
    request
}
