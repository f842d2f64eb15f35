//! The standard Requirements → CodeGeneration → Testing → Documentation →
//! QualityAssurance pipeline, assembled from a [`PipelineConfig`].
//!
//! Each configured agent's `role` picks its behavior and guardrails; its
//! `tools` list is resolved against the registry from [`standard_tools`].

mod codegen;
mod documentation;
mod guards;
mod qa;
mod requirements;
mod testing;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::agent::{Agent, AgentBuilder, Payload, StageContext};
use crate::config::PipelineConfig;
use crate::error::AgentExecutionError;
use crate::registry::{AgentRegistry, RegistryError};
use crate::state::RunState;
use crate::store::ArtifactKind;
use crate::tools::{
    CodeSynthesis, CommandCheck, CoverageAnalyzer, DiagramGenerator, FileWriter, GitOperations,
    MarkdownWriter, ResearchTool, SchemaValidator, ToolError, ToolRegistry,
};

pub use codegen::{CodeGeneration, slugify};
pub use documentation::Documentation;
pub use guards::{files_generated, project_files_present, requirements_extracted, spec_available};
pub use qa::QualityAssurance;
pub use requirements::{DEFAULT_REQUIREMENT, RequirementsAnalysis, normalize_requirements};
pub use testing::Testing;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("load schema {}: {source}", .path.display())]
    Schema {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("agent '{agent}' has unknown role '{role}'")]
    UnknownRole { agent: String, role: String },

    #[error(transparent)]
    Agent(#[from] AgentExecutionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Process-level inputs the standard tools need besides the config.
#[derive(Debug, Clone, Default)]
pub struct StageEnv {
    /// Root searched by `research_tool`. Nothing matches when unset.
    pub docs_root: Option<PathBuf>,
    /// JSON Schema for `schema_validator`; structural checks when unset.
    pub schema_path: Option<PathBuf>,
    /// Bearer token for `code_synthesis`.
    pub api_key: Option<String>,
}

impl StageEnv {
    /// Take the synthesis API key named `key_env` from an environment
    /// snapshot. An empty value counts as unset.
    pub fn with_api_key_from<K, V>(
        mut self,
        key_env: &str,
        vars: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        self.api_key = vars
            .into_iter()
            .find(|(key, _)| key.as_ref() == key_env)
            .map(|(_, value)| value.into())
            .filter(|value| !value.is_empty());
        self
    }
}

/// Every tool the standard stages may be configured with.
pub fn standard_tools(config: &PipelineConfig, env: &StageEnv) -> Result<ToolRegistry, BuildError> {
    let offline = config.offline;

    let schema = match &env.schema_path {
        Some(path) => SchemaValidator::from_path(path).map_err(|source| BuildError::Schema {
            path: path.clone(),
            source,
        })?,
        None => SchemaValidator::structural(),
    };
    let docs_root = env.docs_root.clone().unwrap_or_default();

    Ok(ToolRegistry::new()
        .register(FileWriter)
        .register(schema)
        .register(ResearchTool::new(docs_root))
        .register(CodeSynthesis::new(
            config.synthesis.endpoint.clone(),
            env.api_key.clone(),
            Duration::from_secs(config.synthesis.timeout_secs),
            offline,
        ))
        .register(GitOperations::new(offline))
        .register(CommandCheck::new("pytest_runner", "python -m pytest -q", offline))
        .register(CoverageAnalyzer)
        .register(MarkdownWriter)
        .register(DiagramGenerator)
        .register(CommandCheck::new("ruff_checker", "ruff check", offline))
        .register(CommandCheck::new("mypy_validator", "mypy", offline))
        .register(CommandCheck::new("bandit_scanner", "bandit -q -r", offline))
        .register(CommandCheck::new("safety_checker", "safety check -r", offline)))
}

/// Build the agent registry described by `config.agents`.
pub fn build_agents(config: &PipelineConfig, tools: &ToolRegistry) -> Result<AgentRegistry, BuildError> {
    let flow = stage_flow(config);

    let mut registry = AgentRegistry::builder();
    for (name, agent) in &config.agents {
        let mut builder = Agent::builder(name.as_str())
            .instructions(agent.instructions.as_str())
            .model(agent.model.clone())
            .uses(agent.tools.iter().cloned());
        if let Some(target) = &agent.handoff_target {
            builder = builder.handoff(target.as_str());
        }
        let builder = with_role(builder, &agent.role, config, &flow).ok_or_else(|| {
            BuildError::UnknownRole {
                agent: name.clone(),
                role: agent.role.clone(),
            }
        })?;
        registry = registry.register(builder.build(tools)?);
    }
    Ok(registry.build()?)
}

fn with_role(
    builder: AgentBuilder,
    role: &str,
    config: &PipelineConfig,
    flow: &[String],
) -> Option<AgentBuilder> {
    let builder = match role {
        "analysis" => builder
            .behavior(RequirementsAnalysis)
            .input_guardrail(spec_available())
            .output_guardrail(requirements_extracted()),
        "codegen" => builder
            .behavior(CodeGeneration)
            .output_guardrail(files_generated()),
        "testing" => builder
            .behavior(Testing)
            .input_guardrail(project_files_present()),
        "documentation" => builder.behavior(Documentation::new(flow.to_vec())),
        "qa" => builder.behavior(QualityAssurance::new(config.parallel.max_workers)),
        _ => return None,
    };
    Some(builder)
}

/// Agent names along the static handoff chain from the start agent.
fn stage_flow(config: &PipelineConfig) -> Vec<String> {
    let mut flow: Vec<String> = Vec::new();
    let mut current = Some(config.start_agent.clone());
    while let Some(name) = current.take() {
        if flow.contains(&name) {
            break;
        }
        current = config
            .agents
            .get(&name)
            .and_then(|agent| agent.handoff_target.clone());
        flow.push(name);
    }
    flow
}

// ---------------------------------------------------------------------------
// helpers shared by the stage behaviors
// ---------------------------------------------------------------------------

/// Write `contents` to `relative` under the run's output directory.
///
/// The path is claimed for rollback as soon as the write lands, so a stage
/// that fails afterwards still leaves a complete artifact trail.
fn write_output(
    cx: &StageContext<'_>,
    state: &mut RunState,
    kind: ArtifactKind,
    relative: &str,
    contents: &str,
) -> Result<Payload, AgentExecutionError> {
    let written = cx.call(
        "file_writer",
        json!({
            "base_dir": state.output_dir().display().to_string(),
            "path": relative,
            "contents": contents,
        }),
    )?;
    state.claim_artifact(kind, relative);
    Ok(written)
}

fn status_of(result: &Payload) -> &str {
    result.get("status").and_then(Value::as_str).unwrap_or("")
}

/// Surface a tool-reported `error` status as a stage warning.
fn warn_on_error(cx: &mut StageContext<'_>, tool: &str, result: &Payload) {
    if status_of(result) == "error" {
        let reason = result.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        cx.warn(format!("{tool}: {reason}"));
    }
}

/// Spec-style text of a scalar: strings as-is, anything else as JSON.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Upper-case the first character and lower-case the rest.
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use serde_json::Value;

    use crate::config::PipelineConfig;
    use crate::registry::AgentRegistry;
    use crate::state::RunState;

    use super::{StageEnv, build_agents, standard_tools};

    pub fn offline_agents() -> AgentRegistry {
        let config = PipelineConfig {
            offline: true,
            ..Default::default()
        };
        let tools = standard_tools(&config, &StageEnv::default()).unwrap();
        build_agents(&config, &tools).unwrap()
    }

    pub fn seeded_state(root: &Path, spec: Value) -> RunState {
        RunState::new(root.join("spec.json"), root.join("out")).with_spec(spec)
    }
}
