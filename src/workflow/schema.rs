// QuectoFlow — Workflow schema validation

use super::error::WorkflowError;
use serde_json::Value;
use std::path::Path;

const BUNDLED_SCHEMA: &str = include_str!("../../assets/workflow_schema.json");

/// A compiled JSON Schema that workflow documents must satisfy before any
/// step runs. Compile once and share across runs.
pub struct SchemaValidator {
    validator: jsonschema::Validator,
}

impl SchemaValidator {
    pub fn from_value(schema: &Value) -> Result<Self, WorkflowError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| WorkflowError::SchemaLoad(format!("schema compile failed: {}", e)))?;
        Ok(Self { validator })
    }

    /// Load and compile a schema from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::SchemaLoad(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let schema: Value = serde_json::from_str(&raw).map_err(|e| {
            WorkflowError::SchemaLoad(format!("invalid schema JSON at '{}': {}", path.display(), e))
        })?;
        Self::from_value(&schema)
    }

    /// The schema shipped with the crate.
    pub fn bundled() -> Result<Self, WorkflowError> {
        let schema: Value = serde_json::from_str(BUNDLED_SCHEMA)
            .map_err(|e| WorkflowError::SchemaLoad(format!("bundled schema: {}", e)))?;
        Self::from_value(&schema)
    }

    pub fn is_valid(&self, doc: &Value) -> bool {
        self.validator.is_valid(doc)
    }

    /// Check `doc`, returning every violation in one `Schema` error.
    pub fn validate(&self, doc: &Value) -> Result<bool, WorkflowError> {
        if self.validator.is_valid(doc) {
            tracing::debug!("Workflow schema validation passed");
            return Ok(true);
        }

        let message = self
            .validator
            .iter_errors(doc)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        tracing::error!(error = %message, "Workflow schema validation failed");
        Err(WorkflowError::Schema { message })
    }
}
