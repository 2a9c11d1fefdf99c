#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use llm_gateway::{
    ChatCompletionClient, ClientConfig, GatewaySettings, LaneDefaults, LaneOrchestrator,
    ModelLaneResolver,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum MockReply {
    Json {
        status: StatusCode,
        body: Value,
        delay: Option<Duration>,
    },
    EventStream {
        frames: Vec<String>,
    },
    /// Starts an error body, then aborts the connection mid-body.
    BrokenBody {
        status: StatusCode,
    },
    /// Sends `frames`, then holds the body open until `release` fires.
    StalledStream {
        frames: Vec<String>,
        release: CancellationToken,
    },
}

impl MockReply {
    pub fn ok(body: Value) -> Self {
        Self::Json {
            status: StatusCode::OK,
            body,
            delay: None,
        }
    }

    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::Json {
            status,
            body: json!({ "error": { "message": message, "code": status.as_u16() } }),
            delay: None,
        }
    }

    pub fn delayed(delay: Duration, body: Value) -> Self {
        Self::Json {
            status: StatusCode::OK,
            body,
            delay: Some(delay),
        }
    }

    pub fn event_stream(chunks: Vec<Value>) -> Self {
        let mut frames = data_frames(chunks);
        frames.push("data: [DONE]\n\n".to_string());
        Self::EventStream { frames }
    }

    pub fn stalled_stream(chunks: Vec<Value>, release: CancellationToken) -> Self {
        Self::StalledStream {
            frames: data_frames(chunks),
            release,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockServerState {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    pub seen_payloads: Arc<Mutex<Vec<Value>>>,
    pub seen_auth_headers: Arc<Mutex<Vec<String>>>,
}

impl MockServerState {
    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            seen_payloads: Arc::new(Mutex::new(Vec::new())),
            seen_auth_headers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn seen_models(&self) -> Vec<String> {
        self.seen_payloads
            .lock()
            .await
            .iter()
            .filter_map(|payload| payload.get("model").and_then(Value::as_str))
            .map(ToString::to_string)
            .collect()
    }

    pub async fn payload(&self, index: usize) -> Value {
        self.seen_payloads
            .lock()
            .await
            .get(index)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

pub struct MockServer {
    pub base_url: String,
    shutdown_tx: oneshot::Sender<()>,
    server_task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn shutdown(self) {
        self.shutdown_tx
            .send(())
            .expect("shutdown signal should send");
        self.server_task.await.expect("server task should join");
    }
}

pub async fn spawn_mock_server(state: MockServerState) -> MockServer {
    let app = Router::new()
        .route("/chat/completions", post(chat_completions_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let local_addr = listener
        .local_addr()
        .expect("listener address should resolve");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });

        server.await.expect("mock server should run");
    });

    MockServer {
        base_url: format!("http://{local_addr}"),
        shutdown_tx,
        server_task,
    }
}

async fn chat_completions_handler(
    State(state): State<MockServerState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let call_number = {
        let mut seen = state.seen_payloads.lock().await;
        seen.push(payload);
        seen.len()
    };
    if let Some(value) = headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
    {
        state.seen_auth_headers.lock().await.push(value.to_string());
    }

    let reply = state
        .replies
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(|| MockReply::error(StatusCode::INTERNAL_SERVER_ERROR, "exhausted test replies"));
    let request_id = format!("hdr-{call_number}");

    match reply {
        MockReply::Json {
            status,
            body,
            delay,
        } => {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            (status, [("x-request-id", request_id)], Json(body)).into_response()
        }
        MockReply::EventStream { frames } => {
            event_stream_response(frame_stream(frames), request_id)
        }
        MockReply::BrokenBody { status } => {
            let chunks: Vec<Result<String, std::io::Error>> = vec![
                Ok("{\"error\":".to_string()),
                Err(std::io::Error::other("mock body aborted")),
            ];
            (
                status,
                [("x-request-id", request_id)],
                Body::from_stream(futures::stream::iter(chunks)),
            )
                .into_response()
        }
        MockReply::StalledStream { frames, release } => {
            let held_open = futures::stream::once(async move {
                release.cancelled_owned().await;
                Ok::<_, Infallible>(String::new())
            });
            event_stream_response(frame_stream(frames).chain(held_open), request_id)
        }
    }
}

fn data_frames(chunks: Vec<Value>) -> Vec<String> {
    chunks
        .into_iter()
        .map(|chunk| format!("data: {chunk}\n\n"))
        .collect()
}

fn frame_stream(frames: Vec<String>) -> impl Stream<Item = Result<String, Infallible>> + Send {
    futures::stream::iter(frames.into_iter().map(Ok::<_, Infallible>))
}

fn event_stream_response<S>(frames: S, request_id: String) -> Response
where
    S: Stream<Item = Result<String, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            ("content-type", "text/event-stream".to_string()),
            ("x-request-id", request_id),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

pub fn test_defaults() -> LaneDefaults {
    LaneDefaults {
        text: strings(&["default/text"]),
        json: strings(&["default/json"]),
        tool_calling: strings(&["default/tools"]),
        exacto_tool_calling: strings(&["default/exacto"]),
        hard_fallback: "default/hard".to_string(),
    }
}

pub fn orchestrator_for(base_url: &str, settings: GatewaySettings) -> LaneOrchestrator {
    let mut config = ClientConfig::new(base_url, "test-openrouter-key");
    config.timeout_ms = 5_000;
    let client = ChatCompletionClient::new(config).expect("client should build");
    LaneOrchestrator::new(client)
        .with_settings(settings)
        .with_resolver(ModelLaneResolver::new(test_defaults()))
}

pub fn completion_body(model: &str, content: Value) -> Value {
    json!({
        "id": "gen-body",
        "model": model,
        "provider": "MockProvider",
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": {
            "prompt_tokens": 1_000,
            "completion_tokens": 200,
            "total_tokens": 1_200,
            "prompt_tokens_details": { "cached_tokens": 250 }
        }
    })
}
