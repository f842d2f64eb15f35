use serde_json::{Value, json};

use crate::agent::{Payload, payload};
use crate::tools::{Tool, ToolError, arg_str, arg_str_or};

/// Renders a markdown page from a title and body.
pub struct MarkdownWriter;

impl Tool for MarkdownWriter {
    fn name(&self) -> &str {
        "markdown_writer"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        let title = arg_str(args, "title")?;
        let body = arg_str_or(args, "body", "");
        Ok(payload(json!({
            "markdown": format!("# {title}\n\n{}\n", body.trim()),
        })))
    }
}

/// Renders a mermaid flow diagram through the given stage names.
///
/// Args: `label`, `nodes` (ordered list of names).
pub struct DiagramGenerator;

impl Tool for DiagramGenerator {
    fn name(&self) -> &str {
        "diagram_generator"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        let label = arg_str_or(args, "label", "flow");
        let nodes: Vec<&str> = args
            .get("nodes")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut diagram = String::from("graph TD;");
        for pair in nodes.windows(2) {
            diagram.push_str(&format!("\n  {}-->{};", pair[0], pair[1]));
        }

        Ok(payload(json!({
            "diagram": diagram,
            "label": label,
        })))
    }
}
