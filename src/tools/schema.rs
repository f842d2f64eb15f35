use std::path::Path;

use jsonschema::Draft;
use serde_json::{Value, json};

use crate::agent::{Payload, payload};
use crate::tools::{Tool, ToolError};

const REQUIRED_KEYS: [&str; 2] = ["project", "requirements"];

/// Validates a spec document and reports problems as warnings.
///
/// With a schema file the document is checked against it (Draft 2020-12);
/// without one, only the top-level required keys are checked.
///
/// Args: `document`. Returns `{status: "ok", mode, warnings: [..]}`.
pub struct SchemaValidator {
    compiled: Option<jsonschema::Validator>,
}

impl SchemaValidator {
    /// Validator without a schema file.
    pub fn structural() -> Self {
        Self { compiled: None }
    }

    /// Load and compile a schema file once, so a broken schema fails at
    /// startup rather than mid-run.
    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        let raw = std::fs::read_to_string(path)?;
        let schema: Value = serde_json::from_str(&raw)?;
        Ok(Self {
            compiled: Some(compile(&schema)?),
        })
    }
}

fn compile(schema: &Value) -> Result<jsonschema::Validator, ToolError> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| ToolError::other(format!("compile json schema: {err}")))
}

impl Tool for SchemaValidator {
    fn name(&self) -> &str {
        "schema_validator"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        let document = args
            .get("document")
            .ok_or_else(|| ToolError::invalid("missing argument 'document'"))?;

        let (mode, warnings): (&str, Vec<String>) = match &self.compiled {
            Some(compiled) => {
                let warnings = compiled
                    .iter_errors(document)
                    .map(|err| err.to_string())
                    .collect();
                ("schema", warnings)
            }
            None => {
                let missing: Vec<&str> = REQUIRED_KEYS
                    .iter()
                    .copied()
                    .filter(|key| document.get(key).is_none())
                    .collect();
                let warnings = if missing.is_empty() {
                    Vec::new()
                } else {
                    vec![format!("missing keys: {}", missing.join(", "))]
                };
                ("structural", warnings)
            }
        };

        Ok(payload(json!({
            "status": "ok",
            "mode": mode,
            "warnings": warnings,
        })))
    }
}
