// QuectoFlow — Tool registry

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("tool '{name}' failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A named function invoked by `tool_call` steps.
///
/// Inputs arrive keyed by the step's `input_keys`; the returned values are
/// zipped positionally onto the step's `output_keys`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, inputs: HashMap<String, Value>) -> anyhow::Result<Vec<Value>>;
}

type ToolFn = dyn Fn(HashMap<String, Value>) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// Adapts a plain closure into a [`Tool`].
pub struct FnTool {
    name: String,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(HashMap<String, Value>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, inputs: HashMap<String, Value>) -> anyhow::Result<Vec<Value>> {
        (self.func)(inputs)
    }
}

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name, tool);
    }

    pub async fn invoke(
        &self,
        name: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<Vec<Value>, ToolError> {
        // Clone the handle so the lock is not held across the tool call.
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            tracing::error!(tool = %name, "Tool not found");
            return Err(ToolError::NotFound(name.to_string()));
        };

        tracing::info!(tool = %name, "Executing tool");
        let start = std::time::Instant::now();
        let result = tool.invoke(inputs).await;
        let duration = start.elapsed();

        match result {
            Ok(values) => {
                tracing::info!(tool = %name, duration_ms = %duration.as_millis(), values = values.len(), "Tool completed");
                Ok(values)
            }
            Err(e) => {
                tracing::error!(tool = %name, duration_ms = %duration.as_millis(), error = %e, "Tool failed");
                Err(ToolError::Failed {
                    name: name.to_string(),
                    source: e,
                })
            }
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new("upper", |inputs| {
                let s = inputs
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_uppercase();
                Ok(vec![json!(s)])
            })))
            .await;

        let mut inputs = HashMap::new();
        inputs.insert("text".to_string(), json!("abc"));
        let out = registry.invoke("upper", inputs).await.unwrap();
        assert_eq!(out, vec![json!("ABC")]);
        assert_eq!(registry.list().await, vec!["upper".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("missing", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(ref n) if n == "missing"));
    }

    #[tokio::test]
    async fn test_tool_error_is_wrapped() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(
                FnTool::new("boom", |_| Err(anyhow::anyhow!("exploded"))),
            ))
            .await;
        let err = registry.invoke("boom", HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }
}
