use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::messages::{WireFunctionCall, WireToolCall};

/// Upper bound on distinct tool calls tracked for one stream.
pub const MAX_TOOL_CALLS_PER_STREAM: usize = 64;

/// One streamed fragment of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    /// Usually a string fragment; some providers send an already-decoded object.
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl FunctionDelta {
    fn arguments_fragment(&self) -> Option<String> {
        match self.arguments.as_ref()? {
            Value::Null => None,
            Value::String(fragment) => Some(fragment.clone()),
            structured => Some(structured.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AssembledToolCall {
    /// A call can be executed only once it has a name and object arguments.
    pub fn is_usable(&self) -> bool {
        !self.name.trim().is_empty() && is_valid_json_object(&self.arguments)
    }

    pub fn parsed_arguments(&self) -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.arguments).ok()? {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> WireToolCall {
        WireToolCall {
            id: self.id.clone(),
            kind: "function".to_string(),
            function: WireFunctionCall {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

/// A complete tool call on a non-streaming response message. Every field is
/// optional and arguments may arrive already decoded.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseToolCall {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

impl From<ResponseToolCall> for AssembledToolCall {
    fn from(call: ResponseToolCall) -> Self {
        let id = call
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(placeholder_id);
        let (name, arguments) = call
            .function
            .map(|function| {
                let arguments = function.arguments_fragment().unwrap_or_default();
                (function.name.unwrap_or_default(), arguments)
            })
            .unwrap_or_default();

        Self {
            id,
            name,
            arguments,
        }
    }
}

pub fn is_valid_json_object(raw: &str) -> bool {
    matches!(serde_json::from_str::<Value>(raw), Ok(Value::Object(_)))
}

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    has_upstream_id: bool,
    name: String,
    arguments: String,
}

/// Rebuilds tool calls from streamed fragments. One instance serves exactly
/// one stream.
///
/// Fragments are routed to a call slot by explicit `index` when present, then
/// by a previously seen `id`, and otherwise to the most recently active slot.
#[derive(Debug)]
pub struct ToolCallAssembler {
    calls: HashMap<u32, PendingToolCall>,
    first_seen: Vec<u32>,
    index_by_id: HashMap<String, u32>,
    next_index: u32,
    last_index: Option<u32>,
    capacity: usize,
}

impl Default for ToolCallAssembler {
    fn default() -> Self {
        Self::with_capacity(MAX_TOOL_CALLS_PER_STREAM)
    }
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            calls: HashMap::new(),
            first_seen: Vec::new(),
            index_by_id: HashMap::new(),
            next_index: 0,
            last_index: None,
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns `false` when the fragment was dropped because the stream already
    /// tracks the maximum number of calls.
    pub fn ingest(&mut self, delta: &ToolCallDelta) -> bool {
        let id = delta
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let index = self.resolve_index(delta.index, id);

        if !self.calls.contains_key(&index) {
            if self.calls.len() >= self.capacity {
                warn!(
                    index,
                    capacity = self.capacity,
                    "dropping tool call fragment beyond per-stream capacity"
                );
                return false;
            }
            self.calls.insert(
                index,
                PendingToolCall {
                    id: placeholder_id(),
                    has_upstream_id: false,
                    name: String::new(),
                    arguments: String::new(),
                },
            );
            self.first_seen.push(index);
        }
        self.last_index = Some(index);
        self.next_index = self.next_index.max(index.saturating_add(1));

        let Some(call) = self.calls.get_mut(&index) else {
            return false;
        };
        if let Some(id) = id
            && !call.has_upstream_id
        {
            call.id = id.to_string();
            call.has_upstream_id = true;
        }
        if let Some(function) = delta.function.as_ref() {
            if let Some(name) = function.name.as_deref().filter(|name| !name.is_empty()) {
                call.name = name.to_string();
            }
            if let Some(fragment) = function.arguments_fragment() {
                call.arguments.push_str(&fragment);
            }
        }
        true
    }

    /// Every tracked call in first-seen order, unvalidated. Clears all state.
    pub fn drain(&mut self) -> Vec<AssembledToolCall> {
        let order = std::mem::take(&mut self.first_seen);
        let mut calls = std::mem::take(&mut self.calls);
        self.index_by_id.clear();
        self.next_index = 0;
        self.last_index = None;

        order
            .into_iter()
            .filter_map(|index| calls.remove(&index))
            .map(|call| AssembledToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            })
            .collect()
    }

    /// Like [`drain`](Self::drain), minus calls without a name or with
    /// arguments that are not a JSON object.
    pub fn drain_usable(&mut self) -> Vec<AssembledToolCall> {
        retain_usable(self.drain())
    }

    fn resolve_index(&mut self, explicit_index: Option<u32>, id: Option<&str>) -> u32 {
        if let Some(index) = explicit_index {
            if let Some(id) = id {
                self.index_by_id.insert(id.to_string(), index);
            }
            return index;
        }

        if let Some(id) = id {
            if let Some(index) = self.index_by_id.get(id) {
                return *index;
            }
            let index = self.next_index;
            self.index_by_id.insert(id.to_string(), index);
            return index;
        }

        self.last_index.unwrap_or(self.next_index)
    }
}

/// Drops calls that cannot be executed, logging each one.
pub fn retain_usable(calls: Vec<AssembledToolCall>) -> Vec<AssembledToolCall> {
    calls
        .into_iter()
        .filter(|call| {
            let usable = call.is_usable();
            if !usable {
                warn!(
                    tool_call_id = %call.id,
                    tool_name = %call.name,
                    "discarding incomplete tool call"
                );
            }
            usable
        })
        .collect()
}

fn placeholder_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}
