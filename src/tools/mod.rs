//! Tool registry and dispatch
//!
//! The live model may ask the client to run one of a fixed set of functions.
//! [`ToolDispatcher`] resolves each request of a batch by exact name, runs the
//! batch concurrently, and returns one correlated result per request.

pub mod console;
pub mod weather;

pub use weather::{WeatherClient, WeatherReport};

use crate::config::ConfigError;
use crate::gemini::{FunctionCall, FunctionDeclaration, FunctionResponse, Tool};
use futures_util::future::join_all;
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Functions the client knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolKind {
    Weather,
    ConsoleLogName,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::Weather, ToolKind::ConsoleLogName];

    /// Function name as declared to the model.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Weather => "get_weather",
            Self::ConsoleLogName => "console_log_name",
        }
    }

    /// Exact match on the declared function name.
    pub fn from_name(name: &str) -> Option<Self> {
        ToolKind::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        match self {
            Self::Weather => weather::declaration(),
            Self::ConsoleLogName => console::declaration(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(kind) = ToolKind::from_name(s) {
            return Ok(kind);
        }
        match s.to_ascii_lowercase().as_str() {
            "weather" => Ok(ToolKind::Weather),
            "console" => Ok(ToolKind::ConsoleLogName),
            _ => Err(ConfigError::UnknownTool(s.to_string())),
        }
    }
}

/// Tool declarations for the setup message; empty when no tool is enabled.
pub fn declarations(enabled: &BTreeSet<ToolKind>) -> Vec<Tool> {
    if enabled.is_empty() {
        return Vec::new();
    }
    vec![Tool {
        function_declarations: enabled.iter().map(ToolKind::declaration).collect(),
    }]
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Location '{0}' not found")]
    LocationNotFound(String),

    #[error("missing required argument '{0}'")]
    MissingArgument(&'static str),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

static LOCAL_CALL_IDS: AtomicU64 = AtomicU64::new(1);

/// Id used when the model omits one on a function call.
pub fn local_call_id() -> String {
    let n = LOCAL_CALL_IDS.fetch_add(1, Ordering::Relaxed);
    format!("local-{}-{:08x}", n, rand::random::<u32>())
}

/// One function call to run
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

impl From<FunctionCall> for ToolCallRequest {
    fn from(call: FunctionCall) -> Self {
        let id = match call.id {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = local_call_id();
                warn!("Function call '{}' arrived without an id, using {}", call.name, id);
                id
            }
        };
        Self {
            id,
            name: call.name,
            args: call.args,
        }
    }
}

/// Requests from one inbound message
pub type ToolBatch = SmallVec<[ToolCallRequest; 4]>;

pub fn batch_from_calls(calls: Vec<FunctionCall>) -> ToolBatch {
    calls.into_iter().map(ToolCallRequest::from).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn into_function_response(self) -> FunctionResponse {
        let response = match self.outcome {
            ToolOutcome::Success(value) => serde_json::json!({ "result": value }),
            ToolOutcome::Failure(message) => serde_json::json!({ "error": message }),
        };
        FunctionResponse {
            id: self.id,
            name: self.name,
            response,
        }
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(ToolError::MissingArgument(key))
}

/// Runs function-call batches against the enabled tools.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    enabled: BTreeSet<ToolKind>,
    weather: WeatherClient,
}

impl ToolDispatcher {
    pub fn new(enabled: BTreeSet<ToolKind>, weather: WeatherClient) -> Self {
        Self { enabled, weather }
    }

    pub fn enabled(&self) -> &BTreeSet<ToolKind> {
        &self.enabled
    }

    /// Run every request of a batch. Always returns exactly one result per
    /// request, in request order.
    pub async fn dispatch(&self, batch: ToolBatch) -> Vec<ToolCallResult> {
        debug!("Dispatching {} function call(s)", batch.len());
        join_all(batch.into_iter().map(|request| self.invoke(request))).await
    }

    async fn invoke(&self, request: ToolCallRequest) -> ToolCallResult {
        let kind = ToolKind::from_name(&request.name).filter(|k| self.enabled.contains(k));

        let outcome = match kind {
            None => {
                warn!("Model requested unknown function '{}'", request.name);
                ToolOutcome::Failure(format!("Unknown function: {}", request.name))
            }
            Some(kind) => match self.run(kind, &request.args).await {
                Ok(value) => {
                    info!("Function '{}' ({}) succeeded", request.name, request.id);
                    ToolOutcome::Success(value)
                }
                Err(e) => {
                    warn!("Function '{}' ({}) failed: {}", request.name, request.id, e);
                    ToolOutcome::Failure(e.to_string())
                }
            },
        };

        ToolCallResult {
            id: request.id,
            name: request.name,
            outcome,
        }
    }

    async fn run(&self, kind: ToolKind, args: &Map<String, Value>) -> Result<Value, ToolError> {
        match kind {
            ToolKind::Weather => {
                let location = string_arg(args, "location")?;
                let report = self.weather.fetch(location).await?;
                Ok(serde_json::to_value(report)?)
            }
            ToolKind::ConsoleLogName => {
                let name = string_arg(args, "name")?;
                Ok(console::log_name(name))
            }
        }
    }
}
