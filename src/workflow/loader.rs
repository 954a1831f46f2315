// QuectoFlow — Reading workflow documents and initial inputs

use super::context::Context;
use super::error::WorkflowError;
use serde_json::Value;
use std::path::Path;

/// Read a workflow document. `.yaml`/`.yml` files are parsed as YAML, every
/// other extension as JSON.
pub fn load_document(path: &Path) -> Result<Value, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let doc: Value = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    tracing::debug!(path = %path.display(), yaml = is_yaml, "Loaded workflow document");
    Ok(doc)
}

/// Parse an initial-context blob. It must be a flat JSON object.
pub fn context_from_str(raw: &str) -> Result<Context, WorkflowError> {
    let value: Value = serde_json::from_str(raw)?;
    Context::from_value(value)
        .ok_or_else(|| WorkflowError::parse("initial context must be a JSON object"))
}

/// Read an initial-context blob from a file.
pub fn load_context(path: &Path) -> Result<Context, WorkflowError> {
    context_from_str(&std::fs::read_to_string(path)?)
}
