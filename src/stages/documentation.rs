use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::agent::{Behavior, Payload, StageContext, payload};
use crate::error::AgentExecutionError;
use crate::state::RunState;
use crate::store::ArtifactKind;

use super::{text, write_output};

const README: &str = "README.md";
const FLOW_DIAGRAM: &str = "docs/flow.mmd";

/// Renders the README and a mermaid diagram of the stage flow.
pub struct Documentation {
    flow: Vec<String>,
}

impl Documentation {
    /// `flow` is the ordered list of stage names drawn in the diagram.
    pub fn new(flow: Vec<String>) -> Self {
        Self { flow }
    }
}

impl Behavior for Documentation {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        let title = project_name(state);
        let requirements = state
            .requirements
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n");
        let markdown = cx.call(
            "markdown_writer",
            json!({
                "title": title,
                "body": format!("## Requirements\n\n{requirements}"),
            }),
        )?;
        let diagram = cx.call(
            "diagram_generator",
            json!({ "label": "agent-flow", "nodes": self.flow }),
        )?;

        let readme = field(&markdown, "markdown");
        let flow = field(&diagram, "diagram");
        write_output(cx, state, ArtifactKind::Doc, README, &readme)?;
        write_output(cx, state, ArtifactKind::Doc, FLOW_DIAGRAM, &flow)?;
        state.documentation = BTreeMap::from([
            (README.to_string(), readme),
            (FLOW_DIAGRAM.to_string(), flow),
        ]);

        cx.event("documentation_pages=2");
        cx.artifact("markdown", Value::Object(markdown));
        cx.artifact("diagram", Value::Object(diagram));

        Ok(payload(json!({ "documents": format!("{README}, {FLOW_DIAGRAM}") })))
    }
}

fn project_name(state: &RunState) -> String {
    state
        .metadata
        .get("project")
        .and_then(|p| p.get("name"))
        .or_else(|| state.loaded_spec()?.get("project")?.get("name"))
        .map(text)
        .unwrap_or_else(|| "Generated Project".into())
}

fn field(result: &Payload, key: &str) -> String {
    result.get(key).map(text).unwrap_or_default()
}
