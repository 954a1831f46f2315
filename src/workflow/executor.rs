// QuectoFlow — Workflow executor (step dispatcher)
//
// validate -> resolve placeholders -> dispatch steps in order -> report.
// Steps mutate a per-run `Context` passed down by `&mut`; the executor
// itself only holds read-mostly collaborators and can serve many runs.

use super::context::Context;
use super::error::{StepError, WorkflowError};
use super::expr;
use super::placeholder;
use super::schema::SchemaValidator;
use super::{
    ApiCallStep, ConditionalStep, FailurePolicy, ForLoopStep, LlmCallStep, Step, ToolCallStep,
    WhileLoopStep, Workflow,
};
use crate::api::{ApiClient, ReqwestApiClient};
use crate::config::{Config, ExecutorConfig};
use crate::provider::{self, LLMProvider, Message};
use crate::tool::ToolRegistry;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Context key that receives the raw reply of an `llm_call` without
/// `output_keys`.
pub const RESPONSE_KEY: &str = "response";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub failure_policy: FailurePolicy,
    pub max_while_iterations: usize,
    pub api_timeout: Duration,
    pub llm_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            failure_policy: cfg.failure_policy,
            max_while_iterations: cfg.max_while_iterations,
            api_timeout: cfg.api_timeout(),
            llm_timeout: cfg.llm_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// A non-terminal step failure recorded during a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    /// Location in the workflow tree, e.g. `steps[2].body[0]`.
    pub path: String,
    pub kind: String,
    pub error: String,
    /// Message history of a failed `llm_call`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub context: Context,
    pub failures: Vec<StepFailure>,
    #[serde(skip)]
    output_keys: Option<Vec<String>>,
}

impl RunReport {
    /// The workflow's declared `outputs`, or the whole context.
    pub fn outputs(&self) -> Context {
        match &self.output_keys {
            Some(keys) => self.context.select(keys),
            None => self.context.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Progress notifications for callers that stream a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        steps: usize,
    },
    StepStarted {
        path: String,
        kind: String,
    },
    StepCompleted {
        path: String,
        kind: String,
        duration_ms: u64,
    },
    StepFailed {
        path: String,
        kind: String,
        error: String,
    },
    StepSkipped {
        path: String,
        kind: String,
    },
    RunCompleted {
        run_id: String,
        failures: usize,
    },
}

impl ProgressEvent {
    /// Human-readable one-liner.
    pub fn message(&self) -> String {
        match self {
            ProgressEvent::RunStarted { steps, .. } => {
                format!("Executing workflow ({} steps)...", steps)
            }
            ProgressEvent::StepStarted { path, kind } => format!("Executing {} at {}", kind, path),
            ProgressEvent::StepCompleted {
                path, duration_ms, ..
            } => format!("Completed {} in {}ms", path, duration_ms),
            ProgressEvent::StepFailed { path, error, .. } => format!("Step {} failed: {}", path, error),
            ProgressEvent::StepSkipped { path, kind } => {
                format!("Skipped {}: unknown step kind '{}'", path, kind)
            }
            ProgressEvent::RunCompleted { failures: 0, .. } => {
                "Workflow execution completed.".to_string()
            }
            ProgressEvent::RunCompleted { failures, .. } => {
                format!("Workflow execution completed with {} failed step(s).", failures)
            }
        }
    }

    /// One NDJSON line: the event fields, a timestamp, and
    /// `{"message": {"content": ...}}`.
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
            obj.insert("message".into(), json!({ "content": self.message() }));
        }
        Ok(serde_json::to_string(&value)? + "\n")
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

struct RunState {
    policy: FailurePolicy,
    failures: Vec<StepFailure>,
    events: Option<mpsc::Sender<ProgressEvent>>,
}

impl RunState {
    /// Fresh state for a parallel member: same policy and event sink, own
    /// failure list.
    fn fork(&self) -> Self {
        Self {
            policy: self.policy,
            failures: Vec::new(),
            events: self.events.clone(),
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// A fail-fast abort that has already been recorded.
struct Aborted {
    path: String,
    error: StepError,
}

enum StepFault {
    Failed {
        error: StepError,
        messages: Vec<Message>,
    },
    Aborted(Aborted),
}

impl From<StepError> for StepFault {
    fn from(error: StepError) -> Self {
        StepFault::Failed {
            error,
            messages: Vec::new(),
        }
    }
}

impl From<Aborted> for StepFault {
    fn from(aborted: Aborted) -> Self {
        StepFault::Aborted(aborted)
    }
}

/// Extract a JSON value from an LLM reply, tolerating a Markdown code fence.
fn parse_json_reply(text: &str) -> Result<Value, serde_json::Error> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    schema: SchemaValidator,
    tools: ToolRegistry,
    api: Arc<dyn ApiClient>,
    llm: Arc<dyn LLMProvider>,
    settings: ExecutorSettings,
}

impl WorkflowExecutor {
    pub fn new(
        schema: SchemaValidator,
        tools: ToolRegistry,
        api: Arc<dyn ApiClient>,
        llm: Arc<dyn LLMProvider>,
    ) -> Self {
        Self {
            schema,
            tools,
            api,
            llm,
            settings: ExecutorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wire up the schema, HTTP client and LLM provider described by `cfg`.
    pub fn from_config(cfg: &Config, tools: ToolRegistry) -> anyhow::Result<Self> {
        let schema = match &cfg.executor.schema_path {
            Some(path) => SchemaValidator::from_path(Path::new(path))?,
            None => SchemaValidator::bundled()?,
        };
        let api = ReqwestApiClient::new(cfg.executor.api_timeout())?;
        let llm: Arc<dyn LLMProvider> = match provider::factory::create_provider(cfg) {
            Ok(p) => Arc::from(p),
            Err(e) => {
                tracing::warn!(error = %e, "LLM provider unavailable, llm_call steps will fail");
                Arc::new(provider::Unavailable::new(e.to_string()))
            }
        };
        Ok(Self::new(schema, tools, Arc::new(api), llm)
            .with_settings(ExecutorSettings::from(&cfg.executor)))
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Validate `doc` against the schema without running it.
    pub fn validate(&self, doc: &Value) -> Result<bool, WorkflowError> {
        self.schema.validate(doc)
    }

    /// Run a workflow document against the caller's initial inputs.
    pub async fn run(&self, doc: &Value, initial: Context) -> Result<RunReport, WorkflowError> {
        self.run_inner(doc, initial, None).await
    }

    /// Like [`run`](Self::run), additionally sending progress events to `events`.
    pub async fn run_streaming(
        &self,
        doc: &Value,
        initial: Context,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<RunReport, WorkflowError> {
        self.run_inner(doc, initial, Some(events)).await
    }

    async fn run_inner(
        &self,
        doc: &Value,
        initial: Context,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<RunReport, WorkflowError> {
        let run_id = uuid::Uuid::new_v4().to_string();

        self.schema.validate(doc)?;
        let resolved = placeholder::resolve(doc, &initial)?;
        let workflow = Workflow::from_document(&resolved)?;

        let mut state = RunState {
            policy: workflow.failure_policy.unwrap_or(self.settings.failure_policy),
            failures: Vec::new(),
            events,
        };
        let mut ctx = initial;

        let tools = self.tools.list().await;
        tracing::info!(
            run_id = %run_id,
            steps = workflow.steps.len(),
            policy = ?state.policy,
            tools = ?tools,
            "Executing workflow"
        );
        state
            .emit(ProgressEvent::RunStarted {
                run_id: run_id.clone(),
                steps: workflow.steps.len(),
            })
            .await;

        let result = self
            .execute_steps(&workflow.steps, "steps", &mut ctx, &mut state)
            .await;

        state
            .emit(ProgressEvent::RunCompleted {
                run_id: run_id.clone(),
                failures: state.failures.len(),
            })
            .await;

        if let Err(Aborted { path, error }) = result {
            tracing::error!(run_id = %run_id, step = %path, error = %error, "Workflow aborted");
            return Err(WorkflowError::Step {
                path,
                source: error,
            });
        }

        tracing::info!(run_id = %run_id, failures = state.failures.len(), "Workflow execution completed");
        Ok(RunReport {
            run_id,
            context: ctx,
            failures: state.failures,
            output_keys: workflow.outputs,
        })
    }

    /// Execute an already parsed workflow against `ctx`, skipping validation
    /// and placeholder resolution. Returns the recorded step failures.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        ctx: &mut Context,
    ) -> Result<Vec<StepFailure>, WorkflowError> {
        let mut state = RunState {
            policy: workflow.failure_policy.unwrap_or(self.settings.failure_policy),
            failures: Vec::new(),
            events: None,
        };
        match self.execute_steps(&workflow.steps, "steps", ctx, &mut state).await {
            Ok(()) => Ok(state.failures),
            Err(Aborted { path, error }) => Err(WorkflowError::Step {
                path,
                source: error,
            }),
        }
    }

    async fn execute_steps(
        &self,
        steps: &[Step],
        prefix: &str,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), Aborted> {
        for (i, step) in steps.iter().enumerate() {
            let path = format!("{}[{}]", prefix, i);
            self.execute_one(step, path, ctx, state).await?;
        }
        Ok(())
    }

    /// Run one step, record its outcome, and apply the failure policy.
    async fn execute_one(
        &self,
        step: &Step,
        path: String,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), Aborted> {
        let kind = step.kind().to_string();

        if let Step::Unknown(_) = step {
            tracing::warn!(step = %path, kind = %kind, "Unknown step kind, skipping");
            state.failures.push(StepFailure {
                path: path.clone(),
                kind: kind.clone(),
                error: StepError::UnknownStepKind(kind.clone()).to_string(),
                messages: Vec::new(),
            });
            state.emit(ProgressEvent::StepSkipped { path, kind }).await;
            return Ok(());
        }

        tracing::info!(step = %path, "Executing {}", step);
        state
            .emit(ProgressEvent::StepStarted {
                path: path.clone(),
                kind: kind.clone(),
            })
            .await;
        let start = Instant::now();

        match self.execute_step(step, &path, ctx, state).await {
            Ok(()) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::debug!(step = %path, duration_ms = duration_ms, "Step completed");
                state
                    .emit(ProgressEvent::StepCompleted {
                        path,
                        kind,
                        duration_ms,
                    })
                    .await;
                Ok(())
            }
            Err(StepFault::Aborted(aborted)) => Err(aborted),
            Err(StepFault::Failed { error, messages }) => {
                tracing::warn!(step = %path, kind = %kind, error = %error, "Step failed");
                state.failures.push(StepFailure {
                    path: path.clone(),
                    kind: kind.clone(),
                    error: error.to_string(),
                    messages,
                });
                state
                    .emit(ProgressEvent::StepFailed {
                        path: path.clone(),
                        kind,
                        error: error.to_string(),
                    })
                    .await;
                match state.policy {
                    FailurePolicy::BestEffort => Ok(()),
                    FailurePolicy::FailFast => Err(Aborted { path, error }),
                }
            }
        }
    }

    /// Dispatch on the step kind. Boxed because loops, conditionals and
    /// parallel groups recurse back into `execute_steps`.
    fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        path: &'a str,
        ctx: &'a mut Context,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, Result<(), StepFault>> {
        async move {
            match step {
                Step::ToolCall(s) => self.tool_call(s, ctx).await,
                Step::ApiCall(s) => self.api_call(s, ctx).await,
                Step::LlmCall(s) => self.llm_call(s, ctx).await,
                Step::Conditional(s) => self.conditional(s, path, ctx, state).await,
                Step::ForLoop(s) => self.for_loop(s, path, ctx, state).await,
                Step::WhileLoop(s) => self.while_loop(s, path, ctx, state).await,
                Step::Parallel(members) => self.parallel(members, path, ctx, state).await,
                Step::Unknown(kind) => Err(StepError::UnknownStepKind(kind.clone()).into()),
            }
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn tool_call(&self, step: &ToolCallStep, ctx: &mut Context) -> Result<(), StepFault> {
        let inputs: HashMap<String, Value> = ctx
            .gather(&step.input_keys)
            .map_err(StepError::MissingInput)?
            .into_iter()
            .collect();

        let values = self
            .tools
            .invoke(&step.tool, inputs)
            .await
            .map_err(StepError::from)?;

        if values.len() < step.output_keys.len() {
            tracing::debug!(
                tool = %step.tool,
                returned = values.len(),
                expected = step.output_keys.len(),
                "Tool returned fewer values than output keys"
            );
        }
        for (key, value) in step.output_keys.iter().zip(values) {
            ctx.set(key.clone(), value);
        }
        Ok(())
    }

    async fn api_call(&self, step: &ApiCallStep, ctx: &mut Context) -> Result<(), StepFault> {
        let inputs = ctx
            .gather(&step.input_keys)
            .map_err(StepError::MissingInput)?;

        let call = self.api.request(step.method, &step.api, &inputs);
        let response = match tokio::time::timeout(self.settings.api_timeout, call).await {
            Err(_) => {
                return Err(StepError::Timeout {
                    operation: "api_call",
                    secs: self.settings.api_timeout.as_secs(),
                }
                .into())
            }
            Ok(Err(e)) => return Err(StepError::Transport(e.to_string()).into()),
            Ok(Ok(response)) => response,
        };

        if response.status != 200 {
            tracing::warn!(
                endpoint = %step.api,
                method = %step.method,
                status = response.status,
                "API call failed"
            );
            return Err(StepError::Http {
                method: step.method.to_string(),
                endpoint: step.api.clone(),
                status: response.status,
            }
            .into());
        }

        let body = response
            .body
            .as_ref()
            .and_then(|b| b.as_object())
            .ok_or(StepError::InvalidResponse)?;
        for key in &step.output_keys {
            match body.get(key) {
                Some(value) => ctx.set(key.clone(), value.clone()),
                None => tracing::debug!(endpoint = %step.api, key = %key, "Key absent from API response"),
            }
        }
        Ok(())
    }

    async fn llm_call(&self, step: &LlmCallStep, ctx: &mut Context) -> Result<(), StepFault> {
        let mut system_prompt = step.system_prompt.clone();
        if !step.output_keys.is_empty() {
            system_prompt.push_str(&format!(
                "\n\nRespond only with a JSON object containing exactly these keys: {}. \
                 Do not include any other text.",
                step.output_keys.join(", ")
            ));
        }

        let call = provider::complete(self.llm.as_ref(), &step.prompt, &system_prompt);
        let (text, messages) = match tokio::time::timeout(self.settings.llm_timeout, call).await {
            Err(_) => {
                return Err(StepFault::Failed {
                    error: StepError::Timeout {
                        operation: "llm_call",
                        secs: self.settings.llm_timeout.as_secs(),
                    },
                    messages: vec![Message::system(system_prompt.clone()), Message::user(&step.prompt)],
                })
            }
            Ok(Err((e, messages))) => {
                return Err(StepFault::Failed {
                    error: StepError::Llm(e.to_string()),
                    messages,
                })
            }
            Ok(Ok(reply)) => reply,
        };

        if step.output_keys.is_empty() {
            ctx.set(RESPONSE_KEY, Value::String(text));
            return Ok(());
        }

        let parsed = match parse_json_reply(&text) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StepFault::Failed {
                    error: StepError::LlmOutput(format!("expected an object, got {}", other)),
                    messages,
                })
            }
            Err(e) => {
                return Err(StepFault::Failed {
                    error: StepError::LlmOutput(e.to_string()),
                    messages,
                })
            }
        };

        for key in &step.output_keys {
            match parsed.get(key) {
                Some(value) => ctx.set(key.clone(), value.clone()),
                None => tracing::warn!(key = %key, "LLM response is missing a requested key"),
            }
        }
        Ok(())
    }

    async fn conditional(
        &self,
        step: &ConditionalStep,
        path: &str,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), StepFault> {
        for (i, branch) in step.branches.iter().enumerate() {
            let matched =
                expr::evaluate_bool(&branch.expr, ctx).map_err(|source| StepError::Condition {
                    condition: branch.condition.clone(),
                    source,
                })?;
            if matched {
                tracing::debug!(step = %path, condition = %branch.condition, "Condition matched");
                let prefix = format!("{}.conditions[{}].next_step", path, i);
                self.execute_steps(&branch.next_step, &prefix, ctx, state)
                    .await?;
                return Ok(());
            }
        }
        tracing::debug!(step = %path, "No condition matched");
        Ok(())
    }

    async fn for_loop(
        &self,
        step: &ForLoopStep,
        path: &str,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), StepFault> {
        let items: Vec<Value> = match ctx.get(&step.iterable) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Object(map)) => map.keys().cloned().map(Value::String).collect(),
            Some(Value::String(s)) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            _ => {
                return Err(StepError::NotIterable {
                    key: step.iterable.clone(),
                }
                .into())
            }
        };

        let prefix = format!("{}.body", path);
        for item in items {
            ctx.set(step.loop_variable.clone(), item);
            self.execute_steps(&step.body, &prefix, ctx, state).await?;
        }
        Ok(())
    }

    async fn while_loop(
        &self,
        step: &WhileLoopStep,
        path: &str,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), StepFault> {
        let limit = self.settings.max_while_iterations;
        let prefix = format!("{}.body", path);
        let mut iterations = 0;

        loop {
            let keep_going =
                expr::evaluate_bool(&step.expr, ctx).map_err(|source| StepError::Condition {
                    condition: step.condition.clone(),
                    source,
                })?;
            if !keep_going {
                break;
            }
            if iterations >= limit {
                return Err(StepError::IterationLimit { limit }.into());
            }
            iterations += 1;
            self.execute_steps(&step.body, &prefix, ctx, state).await?;
        }

        tracing::debug!(step = %path, iterations = iterations, "while_loop finished");
        Ok(())
    }

    /// Members run concurrently, each on a private copy of the context as it
    /// was on entry. Their writes are merged back in declaration order, so a
    /// later member wins when two write the same key.
    async fn parallel(
        &self,
        members: &[Step],
        path: &str,
        ctx: &mut Context,
        state: &mut RunState,
    ) -> Result<(), StepFault> {
        let snapshot = ctx.clone();

        let runs = members.iter().enumerate().map(|(i, member)| {
            let mut local = snapshot.clone();
            let mut sub = state.fork();
            let member_path = format!("{}.parallel[{}]", path, i);
            async move {
                let result = self
                    .execute_one(member, member_path, &mut local, &mut sub)
                    .await;
                (local, sub, result)
            }
        });
        let results = join_all(runs).await;

        let mut first_abort = None;
        for (local, sub, result) in results {
            for (key, value) in local.changes_since(&snapshot) {
                ctx.set(key, value);
            }
            state.failures.extend(sub.failures);
            if let Err(aborted) = result {
                first_abort.get_or_insert(aborted);
            }
        }

        match first_abort {
            Some(aborted) => Err(aborted.into()),
            None => Ok(()),
        }
    }
}
