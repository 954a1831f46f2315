// QuectoFlow — Workflow error taxonomy

use super::expr::ExprError;
use crate::tool::ToolError;
use thiserror::Error;

/// Errors that end a run. Schema, placeholder and parse errors are raised
/// before any step executes.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("workflow failed schema validation: {message}")]
    Schema { message: String },
    #[error("could not load workflow schema: {0}")]
    SchemaLoad(String),
    #[error("missing placeholder: initial_context.{key} is not defined")]
    MissingPlaceholder { key: String },
    #[error("malformed workflow: {message}")]
    Parse { message: String },
    #[error("step {path} failed: {source}")]
    Step {
        path: String,
        #[source]
        source: StepError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WorkflowError {
    pub fn parse(message: impl Into<String>) -> Self {
        WorkflowError::Parse {
            message: message.into(),
        }
    }
}

/// Errors raised while executing a single step. Under the best-effort
/// policy these are recorded and the run continues.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("input key '{0}' is not present in the context")]
    MissingInput(String),
    #[error("{method} {endpoint} returned HTTP {status}")]
    Http {
        method: String,
        endpoint: String,
        status: u16,
    },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
    #[error("response body is not a JSON object")]
    InvalidResponse,
    #[error("LLM call failed: {0}")]
    Llm(String),
    #[error("LLM response is not valid JSON: {0}")]
    LlmOutput(String),
    #[error("condition '{condition}' could not be evaluated: {source}")]
    Condition {
        condition: String,
        #[source]
        source: ExprError,
    },
    #[error("'{key}' is not iterable")]
    NotIterable { key: String },
    #[error("while_loop exceeded {limit} iterations")]
    IterationLimit { limit: usize },
    #[error("unknown step kind '{0}'")]
    UnknownStepKind(String),
}
