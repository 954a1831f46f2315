// QuectoFlow — Workflow model
//
// A workflow is a tree of typed steps parsed from a JSON document of the form
// `{"workflow": {"steps": [...]}}`. Steps are either
// `{"type": "<kind>", "parameters": {...}}` or `{"parallel": [...]}`.

pub mod context;
pub mod error;
pub mod executor;
pub mod expr;
pub mod loader;
pub mod placeholder;
pub mod schema;

pub use context::Context;
pub use error::{StepError, WorkflowError};
pub use executor::{ExecutorSettings, ProgressEvent, RunReport, StepFailure, WorkflowExecutor};
pub use schema::SchemaValidator;

use crate::api::HttpMethod;
use expr::Expr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and carry on with the next step.
    #[default]
    BestEffort,
    /// Abort the run on the first failed step.
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_effort" => Ok(FailurePolicy::BestEffort),
            "fail_fast" => Ok(FailurePolicy::FailFast),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Workflow {
    pub steps: Vec<Step>,
    /// Per-workflow override of the executor's failure policy.
    pub failure_policy: Option<FailurePolicy>,
    /// Keys reported as the run's output. The whole context when unset.
    pub outputs: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum Step {
    ToolCall(ToolCallStep),
    ApiCall(ApiCallStep),
    LlmCall(LlmCallStep),
    Conditional(ConditionalStep),
    ForLoop(ForLoopStep),
    WhileLoop(WhileLoopStep),
    Parallel(Vec<Step>),
    /// A step whose kind is not recognised. Skipped at run time.
    Unknown(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallStep {
    pub tool: String,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCallStep {
    /// Endpoint URL.
    pub api: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
}

fn default_method() -> HttpMethod {
    HttpMethod::Get
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmCallStep {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub output_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConditionalStep {
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub condition: String,
    pub expr: Expr,
    pub next_step: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct ForLoopStep {
    pub iterable: String,
    pub loop_variable: String,
    pub body: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct WhileLoopStep {
    pub condition: String,
    pub expr: Expr,
    pub body: Vec<Step>,
}

impl Step {
    pub fn kind(&self) -> &str {
        match self {
            Step::ToolCall(_) => "tool_call",
            Step::ApiCall(_) => "api_call",
            Step::LlmCall(_) => "llm_call",
            Step::Conditional(_) => "conditional",
            Step::ForLoop(_) => "for_loop",
            Step::WhileLoop(_) => "while_loop",
            Step::Parallel(_) => "parallel",
            Step::Unknown(kind) => kind,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::ToolCall(s) => write!(f, "tool_call({})", s.tool),
            Step::ApiCall(s) => write!(f, "api_call({} {})", s.method, s.api),
            Step::Parallel(members) => write!(f, "parallel[{}]", members.len()),
            other => f.write_str(other.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

const KINDS: [&str; 6] = [
    "tool_call",
    "api_call",
    "llm_call",
    "conditional",
    "for_loop",
    "while_loop",
];

#[derive(Deserialize)]
struct RawBranch {
    condition: String,
    next_step: Value,
}

#[derive(Deserialize)]
struct RawConditional {
    conditions: Vec<RawBranch>,
}

#[derive(Deserialize)]
struct RawForLoop {
    iterable: String,
    loop_variable: String,
    #[serde(default)]
    body: Value,
}

#[derive(Deserialize)]
struct RawWhileLoop {
    condition: String,
    #[serde(default)]
    body: Value,
}

fn params<T: serde::de::DeserializeOwned>(kind: &str, value: &Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value.clone())
        .map_err(|e| WorkflowError::parse(format!("invalid {} parameters: {}", kind, e)))
}

fn condition(source: &str) -> Result<Expr, WorkflowError> {
    expr::parse(source)
        .map_err(|e| WorkflowError::parse(format!("invalid condition '{}': {}", source, e)))
}

impl Workflow {
    /// Build a workflow from a (validated, placeholder-resolved) document.
    /// Accepts both `{"workflow": {...}}` and a bare `{"steps": [...]}`.
    pub fn from_document(doc: &Value) -> Result<Self, WorkflowError> {
        let body = doc.get("workflow").unwrap_or(doc);
        let steps = body
            .get("steps")
            .ok_or_else(|| WorkflowError::parse("workflow has no 'steps'"))?;
        let steps = match steps {
            Value::Array(_) => steps_from_value(steps)?,
            _ => return Err(WorkflowError::parse("'steps' must be a list")),
        };

        let failure_policy = match body.get("failure_policy") {
            Some(v) => Some(params::<FailurePolicy>("failure_policy", v)?),
            None => None,
        };
        let outputs = match body.get("outputs") {
            Some(v) => Some(params::<Vec<String>>("outputs", v)?),
            None => None,
        };

        Ok(Self {
            steps,
            failure_policy,
            outputs,
        })
    }
}

/// A nested step list may be written as a list or as a single step.
fn steps_from_value(value: &Value) -> Result<Vec<Step>, WorkflowError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(Step::from_value).collect(),
        Value::Object(_) => Ok(vec![Step::from_value(value)?]),
        other => Err(WorkflowError::parse(format!(
            "expected a step or list of steps, got {}",
            other
        ))),
    }
}

impl Step {
    pub fn from_value(value: &Value) -> Result<Step, WorkflowError> {
        let obj = value
            .as_object()
            .ok_or_else(|| WorkflowError::parse(format!("step must be an object, got {}", value)))?;

        if let Some(members) = obj.get("parallel") {
            return match members {
                Value::Array(_) => Ok(Step::Parallel(steps_from_value(members)?)),
                _ => Err(WorkflowError::parse("'parallel' must be a list of steps")),
            };
        }

        let empty = Value::Object(Default::default());
        let (kind, parameters) = match obj.get("type") {
            Some(Value::String(kind)) => (kind.as_str(), obj.get("parameters").unwrap_or(&empty)),
            Some(other) => {
                return Err(WorkflowError::parse(format!(
                    "step 'type' must be a string, got {}",
                    other
                )))
            }
            // Shorthand: {"tool_call": {...params}}
            None => match obj.iter().find(|(k, _)| KINDS.contains(&k.as_str())) {
                Some((kind, parameters)) if obj.len() == 1 => (kind.as_str(), parameters),
                _ => {
                    let kind = obj.keys().next().cloned().unwrap_or_default();
                    return Ok(Step::Unknown(kind));
                }
            },
        };

        let step = match kind {
            "tool_call" => Step::ToolCall(params(kind, parameters)?),
            "api_call" => Step::ApiCall(params(kind, parameters)?),
            "llm_call" => Step::LlmCall(params(kind, parameters)?),
            "conditional" => {
                let raw: RawConditional = params(kind, parameters)?;
                let branches = raw
                    .conditions
                    .into_iter()
                    .map(|b| -> Result<Branch, WorkflowError> {
                        Ok(Branch {
                            expr: condition(&b.condition)?,
                            next_step: steps_from_value(&b.next_step)?,
                            condition: b.condition,
                        })
                    })
                    .collect::<Result<_, _>>()?;
                Step::Conditional(ConditionalStep { branches })
            }
            "for_loop" => {
                let raw: RawForLoop = params(kind, parameters)?;
                Step::ForLoop(ForLoopStep {
                    body: steps_from_value(&raw.body)?,
                    iterable: raw.iterable,
                    loop_variable: raw.loop_variable,
                })
            }
            "while_loop" => {
                let raw: RawWhileLoop = params(kind, parameters)?;
                Step::WhileLoop(WhileLoopStep {
                    expr: condition(&raw.condition)?,
                    body: steps_from_value(&raw.body)?,
                    condition: raw.condition,
                })
            }
            other => Step::Unknown(other.to_string()),
        };
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wrapped_document() {
        let doc = json!({"workflow": {"steps": [
            {"type": "tool_call", "parameters": {"tool": "fetch_leads", "input_keys": ["q"], "output_keys": ["leads"]}},
            {"type": "api_call", "parameters": {"api": "http://x/y", "method": "POST"}}
        ]}});
        let wf = Workflow::from_document(&doc).unwrap();
        assert_eq!(wf.steps.len(), 2);
        match &wf.steps[0] {
            Step::ToolCall(t) => {
                assert_eq!(t.tool, "fetch_leads");
                assert_eq!(t.output_keys, vec!["leads".to_string()]);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &wf.steps[1] {
            Step::ApiCall(a) => assert_eq!(a.method, HttpMethod::Post),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(wf.failure_policy.is_none());
    }

    #[test]
    fn test_parse_bare_document_with_options() {
        let doc = json!({
            "steps": [],
            "failure_policy": "fail_fast",
            "outputs": ["a"]
        });
        let wf = Workflow::from_document(&doc).unwrap();
        assert_eq!(wf.failure_policy, Some(FailurePolicy::FailFast));
        assert_eq!(wf.outputs, Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_parse_nested_steps() {
        let doc = json!({"steps": [
            {"type": "for_loop", "parameters": {
                "iterable": "items", "loop_variable": "x",
                "body": {"tool_call": {"tool": "t"}}
            }},
            {"type": "conditional", "parameters": {"conditions": [
                {"condition": "x > 1", "next_step": {"type": "llm_call", "parameters": {"prompt": "p"}}},
                {"condition": "true", "next_step": [{"parallel": [
                    {"type": "tool_call", "parameters": {"tool": "a"}},
                    {"type": "tool_call", "parameters": {"tool": "b"}}
                ]}]}
            ]}},
            {"type": "while_loop", "parameters": {"condition": "n < 3", "body": []}}
        ]});
        let wf = Workflow::from_document(&doc).unwrap();
        match &wf.steps[0] {
            Step::ForLoop(f) => {
                assert_eq!(f.body.len(), 1);
                assert_eq!(f.body[0].kind(), "tool_call");
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &wf.steps[1] {
            Step::Conditional(c) => {
                assert_eq!(c.branches.len(), 2);
                assert_eq!(c.branches[1].next_step[0].kind(), "parallel");
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(wf.steps[2].kind(), "while_loop");
    }

    #[test]
    fn test_unknown_kind_is_kept() {
        let doc = json!({"steps": [{"type": "send_fax", "parameters": {}}, {"mystery": 1}]});
        let wf = Workflow::from_document(&doc).unwrap();
        assert!(matches!(&wf.steps[0], Step::Unknown(k) if k == "send_fax"));
        assert!(matches!(&wf.steps[1], Step::Unknown(k) if k == "mystery"));
    }

    #[test]
    fn test_bad_condition_is_parse_error() {
        let doc = json!({"steps": [{"type": "while_loop", "parameters": {"condition": "a >", "body": []}}]});
        let err = Workflow::from_document(&doc).unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[test]
    fn test_missing_required_parameter() {
        let doc = json!({"steps": [{"type": "tool_call", "parameters": {"input_keys": []}}]});
        let err = Workflow::from_document(&doc).unwrap_err();
        assert!(err.to_string().contains("tool_call"));
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("fail_fast".parse::<FailurePolicy>(), Ok(FailurePolicy::FailFast));
        assert!("yolo".parse::<FailurePolicy>().is_err());
    }
}
