use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::cost::estimate_for_usage;
use crate::lanes::Lane;
use crate::usage::Usage;

/// Token accounting for one successful call, delivered before the call
/// returns (or before a stream's `done` event).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub lane: Lane,
    pub model: String,
    pub provider: Option<String>,
    pub request_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub cache_hit_percent: Option<f64>,
    pub reasoning_tokens: Option<u64>,
    pub latency_ms: u64,
    pub streamed: bool,
    pub recorded_at: DateTime<Utc>,
}

pub type UsageCallback = Arc<dyn Fn(&UsageReport) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CallTrace<'a> {
    pub(crate) lane: Lane,
    pub(crate) model: &'a str,
    pub(crate) provider: Option<&'a str>,
    pub(crate) request_id: Option<&'a str>,
    pub(crate) latency: Duration,
    pub(crate) streamed: bool,
}

impl UsageReport {
    pub(crate) fn new(trace: CallTrace<'_>, usage: Usage) -> Self {
        Self {
            lane: trace.lane,
            model: trace.model.to_string(),
            provider: trace.provider.map(ToString::to_string),
            request_id: trace.request_id.map(ToString::to_string),
            cost_usd: estimate_for_usage(trace.model, &usage),
            cache_hit_percent: usage.cache_hit_percent(),
            reasoning_tokens: usage.reasoning_tokens,
            usage,
            latency_ms: duration_to_millis(trace.latency),
            streamed: trace.streamed,
            recorded_at: Utc::now(),
        }
    }
}

/// Logs the report and hands it to the caller's callback, if any.
pub(crate) fn emit_usage(report: &UsageReport, callback: Option<&UsageCallback>) {
    info!(
        lane = %report.lane,
        model = %report.model,
        provider = report.provider.as_deref().unwrap_or("unknown"),
        request_id = report.request_id.as_deref().unwrap_or(""),
        prompt_tokens = report.usage.prompt_tokens,
        completion_tokens = report.usage.completion_tokens,
        total_tokens = report.usage.total_tokens,
        cost_usd = report.cost_usd,
        cache_hit_percent = report.cache_hit_percent,
        reasoning_tokens = report.reasoning_tokens,
        latency_ms = report.latency_ms,
        streamed = report.streamed,
        "llm usage recorded"
    );
    if let Some(callback) = callback {
        callback(report);
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{CallTrace, UsageCallback, UsageReport, emit_usage};
    use crate::lanes::Lane;
    use crate::usage::Usage;

    #[test]
    fn report_derives_cost_and_cache_figures() {
        let report = UsageReport::new(
            CallTrace {
                lane: Lane::Json,
                model: "openai/gpt-4o-mini",
                provider: Some("OpenAI"),
                request_id: Some("gen-7"),
                latency: Duration::from_millis(1_250),
                streamed: false,
            },
            Usage {
                prompt_tokens: 10_000,
                completion_tokens: 1_000,
                total_tokens: 11_000,
                cached_tokens: Some(2_500),
                reasoning_tokens: None,
            },
        );

        // 10 * 0.00015 + 1 * 0.0006
        assert_eq!(report.cost_usd, 0.0021);
        assert_eq!(report.cache_hit_percent, Some(25.0));
        assert_eq!(report.latency_ms, 1_250);
        assert_eq!(report.provider.as_deref(), Some("OpenAI"));
    }

    #[test]
    fn emit_usage_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: UsageCallback = Arc::new(move |report: &UsageReport| {
            sink.lock().expect("lock").push(report.model.clone());
        });

        let report = UsageReport::new(
            CallTrace {
                lane: Lane::Text,
                model: "google/gemini-2.5-flash",
                provider: None,
                request_id: None,
                latency: Duration::ZERO,
                streamed: true,
            },
            Usage::default(),
        );
        emit_usage(&report, Some(&callback));

        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["google/gemini-2.5-flash".to_string()]
        );
    }
}
