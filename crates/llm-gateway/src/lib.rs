pub mod client;
pub mod config;
mod config_env;
pub mod cost;
pub mod lanes;
pub mod messages;
pub mod observability;
pub mod orchestrator;
pub mod reliability;
pub mod stream;
pub mod tool_calls;
pub mod usage;

pub use client::{
    ApiError, CallOptions, ChatCompletionClient, ChatCompletionRequest, ChatCompletionResponse,
    ClientError, RawEventStream, ResponseFormat, ResponseMetadata,
};
pub use config::{ClientConfig, ConfigError, EnvSettings, GatewaySettings, SettingsSource};
pub use cost::{CostBreakdown, CostEstimate, Workload, estimate_for_counts, estimate_for_usage};
pub use lanes::{
    CandidateModelList, Lane, LaneDefaults, ModelLaneResolver, ReasoningEffort, ReasoningPolicy,
    reasoning_policy_for,
};
pub use messages::{ChatMessage, ContentPart, MessageContent, Role, ToolChoice, ToolDefinition};
pub use observability::{UsageCallback, UsageReport};
pub use orchestrator::{
    Completion, GatewayError, JsonCompletion, LaneOrchestrator, LaneRequest, parse_json_content,
};
pub use reliability::{
    CircuitState, RateLimitError, RateLimiter, RateLimiterConfig, RateLimiterStatus,
};
pub use stream::{CacheStatus, StreamDeadline, StreamEvent, StreamSummary};
pub use tool_calls::{
    AssembledToolCall, ResponseToolCall, ToolCallAssembler, ToolCallDelta, is_valid_json_object,
};
pub use usage::Usage;
