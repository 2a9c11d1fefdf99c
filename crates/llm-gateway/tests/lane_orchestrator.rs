mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use futures::StreamExt;
use llm_gateway::{
    ChatMessage, ClientError, GatewayError, GatewaySettings, Lane, LaneRequest, RateLimiter,
    RateLimiterConfig, StreamEvent, ToolChoice, ToolDefinition, UsageCallback, UsageReport,
};
use serde::Deserialize;
use serde_json::{Value, json};
use support::{MockReply, MockServerState, completion_body, orchestrator_for, spawn_mock_server, strings};
use tokio_util::sync::CancellationToken;

fn collecting_callback() -> (UsageCallback, Arc<Mutex<Vec<UsageReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let callback: UsageCallback = Arc::new(move |report: &UsageReport| {
        sink.lock().expect("reports lock").push(report.clone());
    });
    (callback, reports)
}

fn text_request() -> LaneRequest {
    LaneRequest::new(
        Lane::Text,
        vec![
            ChatMessage::system("You summarise CRM notes."),
            ChatMessage::user("Summarise: called Acme, follow up Friday."),
        ],
    )
}

#[tokio::test]
async fn falls_back_across_candidates_passing_untried_remainder() {
    let state = MockServerState::with_replies(vec![
        MockReply::error(StatusCode::SERVICE_UNAVAILABLE, "capacity"),
        MockReply::ok(json!({ "error": { "message": "provider overloaded", "code": 502 } })),
        MockReply::ok(completion_body("backup/c", json!("Follow up with Acme on Friday."))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default());
    let (callback, reports) = collecting_callback();

    let request = text_request()
        .with_model("primary/a")
        .with_fallback_models(strings(&["backup/b", "backup/c"]))
        .with_usage_callback(callback);
    let completion = orchestrator
        .complete_text(&request)
        .await
        .expect("third candidate should succeed");

    server.shutdown().await;

    assert_eq!(completion.text, "Follow up with Acme on Friday.");
    assert_eq!(completion.attempts, 3);
    assert_eq!(completion.requested_model, "backup/c");
    assert_eq!(completion.request_id.as_deref(), Some("hdr-3"));
    assert_eq!(completion.provider.as_deref(), Some("MockProvider"));

    assert_eq!(
        state.seen_models().await,
        strings(&["primary/a", "backup/b", "backup/c"])
    );
    let first = state.payload(0).await;
    assert_eq!(first["models"], json!(["backup/b", "backup/c", "default/text"]));
    assert_eq!(first["reasoning"], json!({ "exclude": true }));
    assert_eq!(first["usage"], json!({ "include": true }));
    let third = state.payload(2).await;
    assert_eq!(third["models"], json!(["default/text"]));
    assert_eq!(
        *state.seen_auth_headers.lock().await,
        vec!["Bearer test-openrouter-key".to_string(); 3]
    );

    let reports = reports.lock().expect("reports lock");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].usage.total_tokens, 1_200);
    assert_eq!(reports[0].cache_hit_percent, Some(25.0));
    assert!(!reports[0].streamed);
}

#[tokio::test]
async fn exhausted_attempts_name_the_last_error() {
    let state = MockServerState::with_replies(vec![
        MockReply::error(StatusCode::BAD_GATEWAY, "first"),
        MockReply::error(StatusCode::BAD_GATEWAY, "second"),
        MockReply::error(StatusCode::TOO_MANY_REQUESTS, "third"),
        MockReply::ok(completion_body("never", json!("unreachable"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["lane/one", "lane/two", "lane/three", "lane/four"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let err = orchestrator
        .complete_text(&text_request())
        .await
        .expect_err("all attempts should fail");

    server.shutdown().await;

    let (attempts, last_error) = match err {
        GatewayError::AttemptsExhausted {
            attempts,
            last_error,
        } => (attempts, last_error),
        other => panic!("expected exhausted attempts, got {other:?}"),
    };
    assert_eq!(attempts, 3);
    assert!(matches!(
        *last_error,
        GatewayError::Client(ClientError::Api(ref api)) if api.status == Some(429) && api.message == "third"
    ));
    assert_eq!(state.seen_models().await.len(), 3);
}

#[tokio::test]
async fn json_mode_retries_unparseable_content_on_next_candidate() {
    let state = MockServerState::with_replies(vec![
        MockReply::ok(completion_body("json/a", json!("Sure! Here you go"))),
        MockReply::ok(completion_body(
            "json/b",
            json!("```json\n{\"name\":\"Acme\",\"employees\":42}\n```"),
        )),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        json_models: strings(&["json/a", "json/b"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let request = LaneRequest::new(Lane::Json, vec![ChatMessage::user("Extract the company.")]);
    let completion = orchestrator
        .complete_json(&request)
        .await
        .expect("second candidate should parse");

    server.shutdown().await;

    assert_eq!(completion.value, json!({ "name": "Acme", "employees": 42 }));
    assert_eq!(completion.completion.attempts, 2);
    let first = state.payload(0).await;
    assert_eq!(first["response_format"], json!({ "type": "json_object" }));
    assert!(first.get("reasoning").is_none());
}

#[tokio::test]
async fn json_mode_without_parse_retry_fails_fast() {
    let state = MockServerState::with_replies(vec![
        MockReply::ok(completion_body("json/a", json!("not json"))),
        MockReply::ok(completion_body("json/b", json!("{}"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        json_models: strings(&["json/a", "json/b"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let request =
        LaneRequest::new(Lane::Json, vec![ChatMessage::user("Extract.")]).without_parse_retry();
    let err = orchestrator
        .complete_json(&request)
        .await
        .expect_err("parse failure should surface");

    server.shutdown().await;

    let GatewayError::AttemptsExhausted {
        attempts,
        last_error,
    } = err
    else {
        panic!("expected exhausted attempts, got {err:?}");
    };
    assert_eq!(attempts, 1);
    assert!(
        matches!(*last_error, GatewayError::InvalidJson(_)),
        "got {last_error:?}"
    );
    assert_eq!(state.seen_models().await, strings(&["json/a"]));
}

#[tokio::test]
async fn complete_json_as_decodes_caller_type() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Company {
        name: String,
        employees: u32,
    }

    let state = MockServerState::with_replies(vec![MockReply::ok(completion_body(
        "json/a",
        json!("{\"name\":\"Acme\",\"employees\":42}"),
    ))]);
    let server = spawn_mock_server(state.clone()).await;
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default());

    let company: Company = orchestrator
        .complete_json_as(&LaneRequest::new(
            Lane::Json,
            vec![ChatMessage::user("Extract.")],
        ))
        .await
        .expect("typed decode should succeed");

    server.shutdown().await;

    assert_eq!(
        company,
        Company {
            name: "Acme".to_string(),
            employees: 42
        }
    );
}

#[tokio::test]
async fn timed_out_attempt_moves_to_next_candidate() {
    let state = MockServerState::with_replies(vec![
        MockReply::delayed(
            Duration::from_millis(800),
            completion_body("slow/a", json!("too late")),
        ),
        MockReply::ok(completion_body("fast/b", json!("on time"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["slow/a", "fast/b"]),
        request_timeout_ms: Some(150),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let completion = orchestrator
        .complete_text(&text_request())
        .await
        .expect("fallback should recover from timeout");

    server.shutdown().await;

    assert_eq!(completion.text, "on time");
    assert_eq!(completion.requested_model, "fast/b");
}

#[tokio::test]
async fn cancellation_ends_call_without_retrying() {
    let state = MockServerState::with_replies(vec![
        MockReply::delayed(
            Duration::from_millis(800),
            completion_body("slow/a", json!("too late")),
        ),
        MockReply::ok(completion_body("fast/b", json!("should not be asked"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["slow/a", "fast/b"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .complete_text(&text_request().with_cancellation(cancel))
        .await
        .expect_err("cancelled call should not succeed");

    server.shutdown().await;

    assert!(err.is_cancellation());
    assert_eq!(state.seen_models().await, strings(&["slow/a"]));
}

#[tokio::test]
async fn non_streaming_tool_calls_are_validated() {
    let state = MockServerState::with_replies(vec![MockReply::ok(json!({
        "model": "tools/a",
        "choices": [{
            "message": {
                "content": null,
                "tool_calls": [
                    { "id": "call_ok", "type": "function", "function": { "name": "lookup_contact", "arguments": "{\"email\":\"a@acme.co\"}" } },
                    { "id": "call_bad", "type": "function", "function": { "name": "broken", "arguments": "{\"email\":" } }
                ]
            },
            "finish_reason": "tool_calls"
        }]
    }))]);
    let server = spawn_mock_server(state.clone()).await;
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default());

    let request = LaneRequest::new(Lane::ToolCalling, vec![ChatMessage::user("Find Ann.")])
        .with_tools(
            vec![ToolDefinition::new(
                "lookup_contact",
                "Find a contact by email",
                json!({ "type": "object", "properties": { "email": { "type": "string" } } }),
            )],
            Some(ToolChoice::Auto),
        );
    let completion = orchestrator
        .complete_text(&request)
        .await
        .expect("tool call response should be accepted");

    server.shutdown().await;

    assert_eq!(completion.tool_calls.len(), 1);
    assert_eq!(completion.tool_calls[0].id, "call_ok");
    assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));

    let payload = state.payload(0).await;
    assert_eq!(payload["model"], "default/tools");
    assert_eq!(payload["reasoning"], json!({ "effort": "low" }));
    assert_eq!(payload["tools"][0]["function"]["name"], "lookup_contact");
    assert_eq!(payload["tool_choice"], "auto");
}

#[tokio::test]
async fn non_streaming_tool_calls_accept_structured_arguments() {
    let state = MockServerState::with_replies(vec![MockReply::ok(json!({
        "model": "tools/a",
        "choices": [{
            "message": {
                "content": "calling tool",
                "tool_calls": [
                    { "type": "function", "function": { "name": "lookup_contact", "arguments": { "email": "a@b.co" } } }
                ]
            },
            "finish_reason": "tool_calls"
        }]
    }))]);
    let server = spawn_mock_server(state.clone()).await;
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter should build");
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default())
        .with_rate_limiter(limiter.clone());

    let request = LaneRequest::new(Lane::ToolCalling, vec![ChatMessage::user("Find Ann.")]);
    let completion = orchestrator
        .complete_text(&request)
        .await
        .expect("structured arguments should be accepted");

    server.shutdown().await;

    assert_eq!(completion.text, "calling tool");
    assert_eq!(completion.attempts, 1);
    assert_eq!(completion.tool_calls.len(), 1);
    let call = &completion.tool_calls[0];
    assert!(call.id.starts_with("call_"));
    assert_eq!(
        call.parsed_arguments().and_then(|args| args.get("email").cloned()),
        Some(Value::String("a@b.co".to_string()))
    );
    assert_eq!(limiter.status().error_count, 0);
}

#[tokio::test]
async fn open_circuit_rejects_before_any_request() {
    let state = MockServerState::with_replies(vec![MockReply::ok(completion_body(
        "default/text",
        json!("unreachable"),
    ))]);
    let server = spawn_mock_server(state.clone()).await;
    let limiter = RateLimiter::new(RateLimiterConfig {
        circuit_breaker_error_threshold: 1,
        ..RateLimiterConfig::default()
    })
    .expect("limiter should build");
    limiter.record_error();
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default())
        .with_rate_limiter(limiter);

    let err = orchestrator
        .complete_text(&text_request())
        .await
        .expect_err("open circuit should reject");
    let events = orchestrator
        .stream(text_request())
        .collect::<Vec<_>>()
        .await;

    server.shutdown().await;

    assert!(matches!(err, GatewayError::CircuitOpen(_)), "got {err:?}");
    assert_eq!(events.len(), 1);
    assert!(
        matches!(&events[0], StreamEvent::Error { message } if message.contains("circuit breaker is open"))
    );
    assert!(state.seen_payloads.lock().await.is_empty());
}

#[tokio::test]
async fn attempts_feed_the_shared_rate_limiter() {
    let state = MockServerState::with_replies(vec![
        MockReply::error(StatusCode::SERVICE_UNAVAILABLE, "capacity"),
        MockReply::ok(completion_body("lane/two", json!("done"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let limiter = RateLimiter::new(RateLimiterConfig {
        max_requests_per_minute: 10,
        ..RateLimiterConfig::default()
    })
    .expect("limiter should build");
    let settings = GatewaySettings {
        text_models: strings(&["lane/one", "lane/two"]),
        ..GatewaySettings::default()
    };
    let orchestrator =
        orchestrator_for(&server.base_url, settings).with_rate_limiter(limiter.clone());

    orchestrator
        .complete_text(&text_request().with_max_tokens(500))
        .await
        .expect("second attempt should succeed");

    server.shutdown().await;

    let status = limiter.status();
    assert_eq!(status.remaining_requests, 9, "one admission per operation");
    assert_eq!(status.error_count, 0, "success decays the single failure");
    assert!(status.remaining_tokens < RateLimiterConfig::default().max_tokens_per_minute - 500);
}

#[tokio::test]
async fn stream_emits_text_tool_calls_and_done_in_order() {
    let state = MockServerState::with_replies(vec![
        MockReply::error(StatusCode::SERVICE_UNAVAILABLE, "capacity"),
        MockReply::event_stream(vec![
            json!({ "id": "gen-s", "model": "tools/b", "choices": [{ "delta": { "content": "Looking up " } }] }),
            json!({ "choices": [{ "delta": { "content": "the contact." } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "lookup_contact", "arguments": "{\"ema" } }
            ] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "il\":\"a@acme.co\"}" } }
            ] } }] }),
            json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] }),
            json!({
                "provider": "MockProvider",
                "choices": [],
                "usage": {
                    "prompt_tokens": 400,
                    "completion_tokens": 40,
                    "total_tokens": 440,
                    "prompt_tokens_details": { "cached_tokens": 100 },
                    "completion_tokens_details": { "reasoning_tokens": 12 }
                }
            }),
        ]),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        tool_calling_models: strings(&["tools/a", "tools/b"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);
    let (callback, reports) = collecting_callback();

    let request = LaneRequest::new(Lane::ToolCalling, vec![ChatMessage::user("Find Ann.")])
        .with_usage_callback(callback);
    let events = orchestrator.stream(request).collect::<Vec<_>>().await;

    server.shutdown().await;

    assert_eq!(events.len(), 4, "events: {events:?}");
    assert_eq!(
        events[0],
        StreamEvent::Text {
            content: "Looking up ".to_string()
        }
    );
    assert_eq!(
        events[1],
        StreamEvent::Text {
            content: "the contact.".to_string()
        }
    );
    let StreamEvent::ToolCall(call) = &events[2] else {
        panic!("expected tool call, got {:?}", events[2]);
    };
    assert_eq!(call.name, "lookup_contact");
    assert_eq!(
        call.parsed_arguments().and_then(|args| args.get("email").cloned()),
        Some(Value::String("a@acme.co".to_string()))
    );
    let StreamEvent::Done(summary) = &events[3] else {
        panic!("expected done, got {:?}", events[3]);
    };
    assert_eq!(summary.finish_reason.as_deref(), Some("tool_calls"));
    assert_eq!(summary.request_id.as_deref(), Some("gen-s"));
    assert_eq!(summary.model.as_deref(), Some("tools/b"));
    assert_eq!(summary.provider.as_deref(), Some("MockProvider"));
    assert_eq!(summary.reasoning_tokens, Some(12));
    assert_eq!(summary.cache.map(|cache| cache.hit_percent), Some(25.0));

    assert_eq!(state.seen_models().await, strings(&["tools/a", "tools/b"]));
    assert_eq!(state.payload(1).await["stream"], true);

    let reports = reports.lock().expect("reports lock");
    assert_eq!(reports.len(), 1);
    assert!(reports[0].streamed);
    assert_eq!(reports[0].model, "tools/b");
}

#[tokio::test]
async fn stream_reports_single_error_when_no_candidate_connects() {
    let state = MockServerState::with_replies(vec![
        MockReply::error(StatusCode::BAD_GATEWAY, "a"),
        MockReply::error(StatusCode::BAD_GATEWAY, "b"),
        MockReply::error(StatusCode::BAD_GATEWAY, "c"),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["lane/a", "lane/b", "lane/c"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let events = orchestrator.stream(text_request()).collect::<Vec<_>>().await;

    server.shutdown().await;

    assert_eq!(events.len(), 1);
    assert!(
        matches!(&events[0], StreamEvent::Error { message } if message.contains("after 3 attempt(s)")),
        "got {events:?}"
    );
}

#[tokio::test]
async fn unreadable_error_body_is_reported_as_transport_failure() {
    let state = MockServerState::with_replies(vec![MockReply::BrokenBody {
        status: StatusCode::SERVICE_UNAVAILABLE,
    }]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["lane/a"]),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings).with_max_attempts(1);

    let events = orchestrator.stream(text_request()).collect::<Vec<_>>().await;

    server.shutdown().await;

    assert_eq!(events.len(), 1);
    assert!(
        matches!(&events[0], StreamEvent::Error { message } if message.contains("response body read failed")),
        "got {events:?}"
    );
}

#[tokio::test]
async fn cancelled_stream_yields_no_events() {
    let state = MockServerState::with_replies(vec![MockReply::event_stream(vec![
        json!({ "choices": [{ "delta": { "content": "hello" } }] }),
    ])]);
    let server = spawn_mock_server(state.clone()).await;
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let events = orchestrator
        .stream(text_request().with_cancellation(cancel))
        .collect::<Vec<_>>()
        .await;

    server.shutdown().await;

    assert!(events.is_empty());
    assert!(state.seen_payloads.lock().await.is_empty());
}

#[tokio::test]
async fn mid_stream_failure_is_not_retried_on_next_candidate() {
    let state = MockServerState::with_replies(vec![
        MockReply::event_stream(vec![
            json!({ "choices": [{ "delta": { "content": "partial answer" } }] }),
            json!({ "error": { "message": "upstream overloaded", "code": 502 } }),
        ]),
        MockReply::ok(completion_body("lane/b", json!("unreachable"))),
    ]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["lane/a", "lane/b"]),
        ..GatewaySettings::default()
    };
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter should build");
    let orchestrator = orchestrator_for(&server.base_url, settings).with_rate_limiter(limiter.clone());

    let events = orchestrator.stream(text_request()).collect::<Vec<_>>().await;

    server.shutdown().await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Text {
                content: "partial answer".to_string()
            },
            StreamEvent::Error {
                message: "upstream overloaded".to_string()
            },
        ]
    );
    assert_eq!(state.seen_models().await, strings(&["lane/a"]));
    assert_eq!(limiter.status().error_count, 1);
}

#[tokio::test]
async fn stalled_stream_ends_with_timeout_error() {
    let release = CancellationToken::new();
    let state = MockServerState::with_replies(vec![MockReply::stalled_stream(
        vec![json!({ "choices": [{ "delta": { "content": "thinking" } }] })],
        release.clone(),
    )]);
    let server = spawn_mock_server(state.clone()).await;
    let settings = GatewaySettings {
        text_models: strings(&["slow/a", "fast/b"]),
        request_timeout_ms: Some(150),
        ..GatewaySettings::default()
    };
    let orchestrator = orchestrator_for(&server.base_url, settings);

    let events = tokio::time::timeout(
        Duration::from_secs(3),
        orchestrator.stream(text_request()).collect::<Vec<_>>(),
    )
    .await
    .expect("stalled stream should end on its own");

    release.cancel();
    server.shutdown().await;

    assert_eq!(events.len(), 2, "events: {events:?}");
    assert_eq!(
        events[0],
        StreamEvent::Text {
            content: "thinking".to_string()
        }
    );
    assert_eq!(
        events[1],
        StreamEvent::Error {
            message: "llm stream timed out after 150ms".to_string()
        }
    );
    assert_eq!(state.seen_models().await, strings(&["slow/a"]));
}

#[tokio::test]
async fn cancelling_mid_stream_ends_without_terminal_event() {
    let release = CancellationToken::new();
    let state = MockServerState::with_replies(vec![MockReply::stalled_stream(
        vec![
            json!({ "choices": [{ "delta": { "content": "Drafting" } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "create_note", "arguments": "{}" } }
            ] } }] }),
        ],
        release.clone(),
    )]);
    let server = spawn_mock_server(state.clone()).await;
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter should build");
    let orchestrator = orchestrator_for(&server.base_url, GatewaySettings::default())
        .with_rate_limiter(limiter.clone());

    let cancel = CancellationToken::new();
    let mut events = Box::pin(orchestrator.stream(
        LaneRequest::new(Lane::ToolCalling, vec![ChatMessage::user("Take a note.")])
            .with_cancellation(cancel.clone()),
    ));

    let first = events.next().await;
    cancel.cancel();
    let rest = events.collect::<Vec<_>>().await;

    release.cancel();
    server.shutdown().await;

    assert_eq!(
        first,
        Some(StreamEvent::Text {
            content: "Drafting".to_string()
        })
    );
    assert!(rest.is_empty(), "got {rest:?}");
    assert_eq!(limiter.status().error_count, 0);
}
