//! The [`Tool`] capability and the concrete tools the standard stages use.
//!
//! Tools are registered once per process in a [`ToolRegistry`] and resolved by
//! name when an agent is built. Every tool that would touch the network or
//! spawn a process honours an `offline` flag and reports `skipped` or
//! `simulated` instead.

pub mod command;
pub mod docs;
pub mod file;
pub mod http;
pub mod parse;
pub mod research;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::agent::{Payload, payload};

pub use command::{CmdOutput, CommandCheck, CoverageAnalyzer, GitOperations, run_cmd_in_dir};
pub use docs::{DiagramGenerator, MarkdownWriter};
pub use file::FileWriter;
pub use http::CodeSynthesis;
pub use parse::{extract_json, strip_code_fences};
pub use research::ResearchTool;
pub use schema::SchemaValidator;

/// A named unit of external work.
///
/// Expected failures (a check that did not pass, an unreachable endpoint) are
/// reported through a `status` field in the returned map. `Err` is for
/// failures the calling stage could not have planned for.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError>;
}

#[derive(Debug, Error)]
pub enum ToolError {
    /// The caller passed arguments the tool cannot use.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ToolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ToolError::InvalidArgs(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        ToolError::Other(msg.into())
    }
}

/// Resolved name → tool map held by one agent.
pub type ToolSet = BTreeMap<String, Arc<dyn Tool>>;

/// Process-wide tool table, read-only once built.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: ToolSet,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name. A later registration with the same
    /// name replaces the earlier one.
    pub fn register<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// argument helpers shared by the concrete tools
// ---------------------------------------------------------------------------

pub(crate) fn arg_str<'a>(args: &'a Payload, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid(format!("missing string argument '{key}'")))
}

pub(crate) fn arg_str_or<'a>(args: &'a Payload, key: &str, default: &'a str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or(default)
}

pub(crate) fn skipped(tool: &str, reason: &str) -> Payload {
    payload(serde_json::json!({
        "tool": tool,
        "status": "skipped",
        "reason": reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
            Ok(args.clone())
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let reg = ToolRegistry::new().register(Echo);
        assert!(reg.contains("echo"));
        assert!(reg.get("missing").is_none());

        let out = reg
            .get("echo")
            .unwrap()
            .execute(&payload(json!({"k": 1})))
            .unwrap();
        assert_eq!(out["k"], 1);
    }

    #[test]
    fn debug_lists_tool_names() {
        let reg = ToolRegistry::new().register(Echo);
        assert_eq!(format!("{reg:?}"), r#"["echo"]"#);
    }

    #[test]
    fn arg_str_reports_missing_key() {
        let args = payload(json!({"path": 3}));
        let err = arg_str(&args, "path").unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(msg) if msg.contains("'path'")));
    }

    #[test]
    fn skipped_is_tagged() {
        let p = skipped("ruff_checker", "offline");
        assert_eq!(p["status"], "skipped");
        assert_eq!(p["tool"], "ruff_checker");
    }
}
