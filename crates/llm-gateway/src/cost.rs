use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::usage::Usage;

/// Pricing entry used for model ids the table does not know.
pub const DEFAULT_COST_MODEL: &str = "openai/gpt-4o-mini";

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

const MODEL_RATES: &[(&str, ModelRates)] = &[
    ("openai/gpt-4o-mini", rates(0.000_15, 0.000_6)),
    ("openai/gpt-4o", rates(0.002_5, 0.01)),
    ("openai/gpt-4.1-mini", rates(0.000_4, 0.001_6)),
    ("openai/gpt-4.1", rates(0.002, 0.008)),
    ("anthropic/claude-3.5-haiku", rates(0.000_8, 0.004)),
    ("anthropic/claude-sonnet-4", rates(0.003, 0.015)),
    ("anthropic/claude-opus-4", rates(0.015, 0.075)),
    ("google/gemini-2.5-flash", rates(0.000_3, 0.002_5)),
    ("google/gemini-2.5-pro", rates(0.001_25, 0.01)),
    ("moonshotai/kimi-k2-0905", rates(0.000_6, 0.002_5)),
    ("qwen/qwen3-coder", rates(0.000_4, 0.001_6)),
    ("z-ai/glm-4.6", rates(0.000_6, 0.002_2)),
];

const fn rates(input_per_1k: f64, output_per_1k: f64) -> ModelRates {
    ModelRates {
        input_per_1k,
        output_per_1k,
    }
}

/// Rates for `model`, ignoring case and any `:variant` suffix. Unknown ids
/// get the [`DEFAULT_COST_MODEL`] entry.
pub fn rates_for_model(model: &str) -> ModelRates {
    lookup_rates(model)
        .or_else(|| lookup_rates(DEFAULT_COST_MODEL))
        .unwrap_or(rates(0.000_15, 0.000_6))
}

pub fn is_known_model(model: &str) -> bool {
    lookup_rates(model).is_some()
}

fn lookup_rates(model: &str) -> Option<ModelRates> {
    let normalized = model.trim().to_ascii_lowercase();
    let base = normalized
        .split_once(':')
        .map_or(normalized.as_str(), |(base, _)| base);
    MODEL_RATES
        .iter()
        .find(|(id, _)| *id == base)
        .map(|(_, rates)| *rates)
}

/// Average LLM cost profile of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntityProfile {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub seconds: f64,
}

const fn profile(input_tokens: u64, output_tokens: u64, seconds: f64) -> EntityProfile {
    EntityProfile {
        input_tokens,
        output_tokens,
        seconds,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    CrmMigration,
    DocumentParsing,
    DataEnrichment,
}

impl Workload {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrmMigration => "crm_migration",
            Self::DocumentParsing => "document_parsing",
            Self::DataEnrichment => "data_enrichment",
        }
    }

    /// Entity types priced individually by this workload.
    pub fn entity_types(self) -> &'static [&'static str] {
        match self {
            Self::CrmMigration => &["contact", "company", "deal", "note", "task"],
            Self::DocumentParsing => &["page", "table", "image", "form"],
            Self::DataEnrichment => &["record", "email", "website"],
        }
    }

    /// Profile for `entity_type`; unknown types use the workload's generic
    /// profile.
    pub fn profile(self, entity_type: &str) -> EntityProfile {
        let entity = entity_type.trim().to_ascii_lowercase();
        match (self, entity.as_str()) {
            (Self::CrmMigration, "contact" | "contacts") => profile(350, 150, 0.8),
            (Self::CrmMigration, "company" | "companies") => profile(450, 200, 1.0),
            (Self::CrmMigration, "deal" | "deals") => profile(500, 250, 1.2),
            (Self::CrmMigration, "note" | "notes") => profile(600, 200, 0.6),
            (Self::CrmMigration, "task" | "tasks") => profile(250, 100, 0.5),
            (Self::CrmMigration, _) => profile(400, 180, 0.8),

            (Self::DocumentParsing, "page" | "pages") => profile(1_500, 500, 3.0),
            (Self::DocumentParsing, "table" | "tables") => profile(1_200, 800, 4.0),
            (Self::DocumentParsing, "image" | "images") => profile(1_000, 300, 5.0),
            (Self::DocumentParsing, "form" | "forms") => profile(900, 400, 2.5),
            (Self::DocumentParsing, _) => profile(1_200, 500, 3.0),

            (Self::DataEnrichment, "record" | "records") => profile(300, 200, 1.5),
            (Self::DataEnrichment, "email" | "emails") => profile(200, 100, 0.8),
            (Self::DataEnrichment, "website" | "websites") => profile(2_000, 400, 6.0),
            (Self::DataEnrichment, _) => profile(500, 200, 1.5),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown workload: {0}")]
pub struct UnknownWorkloadError(String);

impl FromStr for Workload {
    type Err = UnknownWorkloadError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "crm_migration" | "crm" | "migration" => Ok(Self::CrmMigration),
            "document_parsing" | "documents" | "parsing" => Ok(Self::DocumentParsing),
            "data_enrichment" | "enrichment" => Ok(Self::DataEnrichment),
            _ => Err(UnknownWorkloadError(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub tokens: u64,
    pub cost: f64,
    pub breakdown: CostBreakdown,
    pub estimated_duration: String,
    pub estimated_seconds: u64,
    /// The model the rates were taken from.
    pub model: String,
}

/// Projects the cost of processing `counts` entities of `workload` on `model`.
/// Costs are rounded to 3 decimals.
pub fn estimate_for_counts<I, S>(workload: Workload, counts: I, model: &str) -> CostEstimate
where
    I: IntoIterator<Item = (S, u64)>,
    S: AsRef<str>,
{
    let mut input_tokens = 0_u64;
    let mut output_tokens = 0_u64;
    let mut seconds = 0.0_f64;
    for (entity_type, count) in counts {
        let profile = workload.profile(entity_type.as_ref());
        input_tokens = input_tokens.saturating_add(count.saturating_mul(profile.input_tokens));
        output_tokens = output_tokens.saturating_add(count.saturating_mul(profile.output_tokens));
        seconds += count as f64 * profile.seconds;
    }

    let priced_model = if is_known_model(model) {
        model.trim().to_string()
    } else {
        DEFAULT_COST_MODEL.to_string()
    };
    let rates = rates_for_model(model);
    let input_cost = input_tokens as f64 / 1_000.0 * rates.input_per_1k;
    let output_cost = output_tokens as f64 / 1_000.0 * rates.output_per_1k;
    let estimated_seconds = seconds.round() as u64;

    CostEstimate {
        tokens: input_tokens.saturating_add(output_tokens),
        cost: round_to(input_cost + output_cost, 3),
        breakdown: CostBreakdown {
            input_tokens,
            output_tokens,
            input_cost: round_to(input_cost, 3),
            output_cost: round_to(output_cost, 3),
        },
        estimated_duration: format_duration(estimated_seconds),
        estimated_seconds,
        model: priced_model,
    }
}

/// Post-hoc USD cost of a finished call, rounded to 4 decimals.
pub fn estimate_for_usage(model: &str, usage: &Usage) -> f64 {
    let rates = rates_for_model(model);
    let cost = usage.prompt_tokens as f64 / 1_000.0 * rates.input_per_1k
        + usage.completion_tokens as f64 / 1_000.0 * rates.output_per_1k;
    round_to(cost, 4)
}

/// `1h 5m`, `3m 20s`, or `45s`.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
