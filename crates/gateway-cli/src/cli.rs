use llm_gateway::{Lane, Workload};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Resolve(ModelSelection),
    Complete(CompleteArgs),
    Estimate(EstimateArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub lane: Lane,
    pub model: Option<String>,
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteArgs {
    pub selection: ModelSelection,
    pub prompt: String,
    pub system: Option<String>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateArgs {
    pub workload: Workload,
    pub counts: Vec<(String, u64)>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliOptions {
    pub command: Command,
    pub json_logs: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing command (expected resolve, complete, or estimate)")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown argument: {0}")]
    UnknownArgument(String),
    #[error("missing value for argument: {0}")]
    MissingValue(String),
    #[error("invalid value for {arg}: {value}")]
    InvalidValue { arg: String, value: String },
    #[error("--count expects entity=number, got: {0}")]
    InvalidCount(String),
    #[error("complete requires --prompt")]
    MissingPrompt,
    #[error("--stream is not supported for the json lane")]
    StreamingJson,
    #[error("help requested")]
    HelpRequested,
}

/// Flags shared by every command, collected before the command is built.
#[derive(Debug, Default)]
struct RawArgs {
    lane: Option<Lane>,
    model: Option<String>,
    fallbacks: Vec<String>,
    prompt: Option<String>,
    system: Option<String>,
    stream: bool,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    workload: Option<Workload>,
    counts: Vec<(String, u64)>,
    json_logs: bool,
}

impl CliOptions {
    pub fn parse<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut iter = args.into_iter();
        let command = match iter.next() {
            Some(command) if command == "--help" || command == "-h" => {
                return Err(CliError::HelpRequested);
            }
            Some(command) => command,
            None => return Err(CliError::MissingCommand),
        };

        let mut raw = RawArgs::default();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(CliError::HelpRequested),
                "--json-logs" => raw.json_logs = true,
                "--stream" => raw.stream = true,
                "--lane" => {
                    let value = next_value(&mut iter, &arg)?;
                    raw.lane = Some(value.parse().map_err(|_| invalid(&arg, &value))?);
                }
                "--model" => raw.model = Some(next_value(&mut iter, &arg)?),
                "--fallback" => raw.fallbacks.push(next_value(&mut iter, &arg)?),
                "--prompt" => raw.prompt = Some(next_value(&mut iter, &arg)?),
                "--system" => raw.system = Some(next_value(&mut iter, &arg)?),
                "--max-tokens" => {
                    let value = next_value(&mut iter, &arg)?;
                    raw.max_tokens = Some(value.parse().map_err(|_| invalid(&arg, &value))?);
                }
                "--temperature" => {
                    let value = next_value(&mut iter, &arg)?;
                    raw.temperature = Some(value.parse().map_err(|_| invalid(&arg, &value))?);
                }
                "--workload" => {
                    let value = next_value(&mut iter, &arg)?;
                    raw.workload = Some(value.parse().map_err(|_| invalid(&arg, &value))?);
                }
                "--count" => {
                    let value = next_value(&mut iter, &arg)?;
                    raw.counts.push(parse_count(&value)?);
                }
                unknown => return Err(CliError::UnknownArgument(unknown.to_string())),
            }
        }

        let json_logs = raw.json_logs;
        let command = match command.as_str() {
            "resolve" => Command::Resolve(raw.selection()),
            "complete" => {
                let stream = raw.stream;
                let lane = raw.lane.unwrap_or(Lane::Text);
                if stream && lane == Lane::Json {
                    return Err(CliError::StreamingJson);
                }
                let prompt = raw.prompt.take().ok_or(CliError::MissingPrompt)?;
                Command::Complete(CompleteArgs {
                    prompt,
                    system: raw.system.take(),
                    stream,
                    max_tokens: raw.max_tokens,
                    temperature: raw.temperature,
                    selection: raw.selection(),
                })
            }
            "estimate" => Command::Estimate(EstimateArgs {
                workload: raw.workload.unwrap_or(Workload::CrmMigration),
                counts: raw.counts,
                model: raw
                    .model
                    .unwrap_or_else(|| llm_gateway::cost::DEFAULT_COST_MODEL.to_string()),
            }),
            other => return Err(CliError::UnknownCommand(other.to_string())),
        };

        Ok(Self { command, json_logs })
    }
}

impl RawArgs {
    fn selection(&mut self) -> ModelSelection {
        ModelSelection {
            lane: self.lane.unwrap_or(Lane::Text),
            model: self.model.take(),
            fallbacks: std::mem::take(&mut self.fallbacks),
        }
    }
}

fn next_value<I>(iter: &mut I, arg: &str) -> Result<String, CliError>
where
    I: Iterator<Item = String>,
{
    iter.next()
        .ok_or_else(|| CliError::MissingValue(arg.to_string()))
}

fn invalid(arg: &str, value: &str) -> CliError {
    CliError::InvalidValue {
        arg: arg.to_string(),
        value: value.to_string(),
    }
}

fn parse_count(raw: &str) -> Result<(String, u64), CliError> {
    let (entity, count) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidCount(raw.to_string()))?;
    let entity = entity.trim();
    if entity.is_empty() {
        return Err(CliError::InvalidCount(raw.to_string()));
    }
    let count = count
        .trim()
        .parse::<u64>()
        .map_err(|_| CliError::InvalidCount(raw.to_string()))?;
    Ok((entity.to_string(), count))
}
