use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GatewaySettings;

/// Used when every other source of candidates is empty.
pub const HARD_FALLBACK_MODEL: &str = "openai/gpt-4o-mini";

const TEXT_DEFAULT_MODELS: [&str; 3] = [
    "google/gemini-2.5-flash",
    "openai/gpt-4o-mini",
    "anthropic/claude-3.5-haiku",
];
const JSON_DEFAULT_MODELS: [&str; 3] = [
    "openai/gpt-4o-mini",
    "google/gemini-2.5-flash",
    "anthropic/claude-3.5-haiku",
];
const TOOL_CALLING_DEFAULT_MODELS: [&str; 3] = [
    "anthropic/claude-sonnet-4",
    "openai/gpt-4.1",
    "google/gemini-2.5-pro",
];
const EXACTO_TOOL_CALLING_DEFAULT_MODELS: [&str; 3] = [
    "moonshotai/kimi-k2-0905:exacto",
    "qwen/qwen3-coder:exacto",
    "z-ai/glm-4.6:exacto",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Text,
    Json,
    ToolCalling,
}

impl Lane {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::ToolCalling => "tool_calling",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown lane: {0}")]
pub struct UnknownLaneError(String);

impl FromStr for Lane {
    type Err = UnknownLaneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "tool_calling" | "tool-calling" | "tools" => Ok(Self::ToolCalling),
            _ => Err(UnknownLaneError(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// The `reasoning` request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
}

pub fn reasoning_policy_for(lane: Lane) -> Option<ReasoningPolicy> {
    match lane {
        Lane::Text => Some(ReasoningPolicy {
            exclude: Some(true),
            effort: None,
        }),
        Lane::ToolCalling => Some(ReasoningPolicy {
            exclude: None,
            effort: Some(ReasoningEffort::Low),
        }),
        Lane::Json => None,
    }
}

/// Ordered, duplicate-free model ids. Position is priority.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateModelList(Vec<String>);

impl CandidateModelList {
    pub fn primary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Candidates after `index`, in priority order.
    pub fn remaining_after(&self, index: usize) -> &[String] {
        self.0.get(index.saturating_add(1)..).unwrap_or(&[])
    }

    fn push_unique(&mut self, model: &str) {
        let model = model.trim();
        if model.is_empty() || self.0.iter().any(|existing| existing == model) {
            return;
        }
        self.0.push(model.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneDefaults {
    pub text: Vec<String>,
    pub json: Vec<String>,
    pub tool_calling: Vec<String>,
    pub exacto_tool_calling: Vec<String>,
    pub hard_fallback: String,
}

impl Default for LaneDefaults {
    fn default() -> Self {
        Self {
            text: to_owned_list(&TEXT_DEFAULT_MODELS),
            json: to_owned_list(&JSON_DEFAULT_MODELS),
            tool_calling: to_owned_list(&TOOL_CALLING_DEFAULT_MODELS),
            exacto_tool_calling: to_owned_list(&EXACTO_TOOL_CALLING_DEFAULT_MODELS),
            hard_fallback: HARD_FALLBACK_MODEL.to_string(),
        }
    }
}

impl LaneDefaults {
    fn for_lane(&self, lane: Lane, exacto_enabled: bool) -> &[String] {
        match lane {
            Lane::Text => &self.text,
            Lane::Json => &self.json,
            Lane::ToolCalling if exacto_enabled => &self.exacto_tool_calling,
            Lane::ToolCalling => &self.tool_calling,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelLaneResolver {
    defaults: LaneDefaults,
}

impl ModelLaneResolver {
    pub fn new(defaults: LaneDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &LaneDefaults {
        &self.defaults
    }

    /// Merges, highest priority first: the explicit model, explicit
    /// fallbacks, the lane override list, the global override list, then the
    /// lane's built-in defaults. First occurrence wins.
    pub fn resolve(
        &self,
        lane: Lane,
        explicit_model: Option<&str>,
        explicit_fallbacks: &[String],
        settings: &GatewaySettings,
    ) -> CandidateModelList {
        let mut candidates = CandidateModelList::default();

        if let Some(model) = explicit_model {
            candidates.push_unique(model);
        }
        let sources = [
            explicit_fallbacks,
            settings.lane_models(lane),
            settings.global_models.as_slice(),
            self.defaults.for_lane(lane, settings.exacto_tool_calling),
        ];
        for model in sources.into_iter().flatten() {
            candidates.push_unique(model);
        }

        if candidates.is_empty() {
            candidates.push_unique(&self.defaults.hard_fallback);
        }
        if candidates.is_empty() {
            candidates.push_unique(HARD_FALLBACK_MODEL);
        }

        candidates
    }
}

fn to_owned_list(models: &[&str]) -> Vec<String> {
    models.iter().map(|model| (*model).to_string()).collect()
}
