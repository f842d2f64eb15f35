use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AgentExecutionError;
use crate::guardrail::{Guardrail, first_failure};
use crate::state::RunState;
use crate::tools::{Tool, ToolRegistry, ToolSet};

/// Key → value map exchanged between stages, tools and guardrails.
pub type Payload = Map<String, Value>;

/// Turn a JSON value into a [`Payload`]. Non-object values are wrapped under
/// `"value"`.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

/// Model selection knobs. Opaque to the orchestrator; tools may read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDescriptor {
    pub name: String,
    pub reasoning_effort: String,
    pub verbosity: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            name: "gpt-5-mini".into(),
            reasoning_effort: "medium".into(),
            verbosity: "medium".into(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl ModelDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// The stage-specific work an [`Agent`] performs.
///
/// Implementations mutate the run state, call tools through the context, and
/// return the stage's output payload.
pub trait Behavior: Send + Sync {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError>;
}

struct FnBehavior<F>(F);

impl<F> Behavior for FnBehavior<F>
where
    F: Fn(&mut RunState, &mut StageContext<'_>) -> Result<Payload, AgentExecutionError>
        + Send
        + Sync,
{
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        (self.0)(state, cx)
    }
}

struct Passthrough;

impl Behavior for Passthrough {
    fn run(&self, _: &mut RunState, _: &mut StageContext<'_>) -> Result<Payload, AgentExecutionError> {
        Ok(Payload::new())
    }
}

/// What a behavior sees while it runs: the agent's own tools plus the event,
/// warning and artifact trail that ends up in the [`AgentRunResult`].
pub struct StageContext<'a> {
    agent: &'a Agent,
    events: Vec<String>,
    warnings: Vec<String>,
    artifacts: Payload,
}

impl<'a> StageContext<'a> {
    fn new(agent: &'a Agent) -> Self {
        Self {
            agent,
            events: Vec::new(),
            warnings: Vec::new(),
            artifacts: Payload::new(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent.name
    }

    pub fn instructions(&self) -> &str {
        &self.agent.instructions
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.agent.model
    }

    /// Look up one of the agent's configured tools.
    ///
    /// Asking for anything else is a programming error and fails loudly.
    pub fn tool(&self, name: &str) -> Result<&Arc<dyn Tool>, AgentExecutionError> {
        self.agent
            .tools
            .get(name)
            .ok_or_else(|| AgentExecutionError::ToolNotRegistered {
                agent: self.agent.name.clone(),
                tool: name.to_string(),
            })
    }

    /// Execute a configured tool. A tool that raises becomes a stage error.
    pub fn call(&self, name: &str, args: Value) -> Result<Payload, AgentExecutionError> {
        let tool = self.tool(name)?;
        tool.execute(&payload(args))
            .map_err(|source| AgentExecutionError::Tool {
                agent: self.agent.name.clone(),
                tool: name.to_string(),
                source,
            })
    }

    pub fn event(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(agent = %self.agent.name, %warning, "stage warning");
        self.warnings.push(warning);
    }

    pub fn artifact(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.artifacts.insert(key.into(), value.into());
    }
}

/// Immutable record of one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub agent_name: String,
    pub output: Payload,
    pub handoff_target: Option<String>,
    pub artifacts: Payload,
    pub events: Vec<String>,
    pub warnings: Vec<String>,
}

/// A named pipeline stage: behavior, tools, guardrails and a handoff target.
///
/// Immutable once built; safe to share across concurrent runs.
pub struct Agent {
    name: String,
    instructions: String,
    model: ModelDescriptor,
    tools: ToolSet,
    input_guardrails: Vec<Arc<dyn Guardrail>>,
    output_guardrails: Vec<Arc<dyn Guardrail>>,
    handoff_target: Option<String>,
    behavior: Arc<dyn Behavior>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model.name)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("handoff_target", &self.handoff_target)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            instructions: String::new(),
            model: ModelDescriptor::default(),
            tool_names: BTreeSet::new(),
            direct_tools: Vec::new(),
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            handoff_target: None,
            behavior: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn handoff_target(&self) -> Option<&str> {
        self.handoff_target.as_deref()
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Run the stage against `state`.
    ///
    /// Input guardrails run first and a rejection means the behavior never
    /// starts. Output guardrails see the input and the produced output; a
    /// rejection discards the output.
    pub fn run(&self, state: &mut RunState) -> Result<AgentRunResult, AgentExecutionError> {
        let input = state.input_payload();
        if let Some((guardrail, errors)) = first_failure(&self.input_guardrails, &input, None) {
            return Err(AgentExecutionError::InputGuardrail {
                agent: self.name.clone(),
                guardrail,
                errors,
            });
        }

        let mut cx = StageContext::new(self);
        cx.event(format!("{}:model={}", self.name, self.model.name));
        cx.event(format!("{}:reasoning={}", self.name, self.model.reasoning_effort));

        let output = self.behavior.run(state, &mut cx)?;

        if let Some((guardrail, errors)) =
            first_failure(&self.output_guardrails, &input, Some(&output))
        {
            return Err(AgentExecutionError::OutputGuardrail {
                agent: self.name.clone(),
                guardrail,
                errors,
            });
        }

        Ok(AgentRunResult {
            agent_name: self.name.clone(),
            output,
            handoff_target: self.handoff_target.clone(),
            artifacts: cx.artifacts,
            events: cx.events,
            warnings: cx.warnings,
        })
    }
}

pub struct AgentBuilder {
    name: String,
    instructions: String,
    model: ModelDescriptor,
    tool_names: BTreeSet<String>,
    direct_tools: Vec<Arc<dyn Tool>>,
    input_guardrails: Vec<Arc<dyn Guardrail>>,
    output_guardrails: Vec<Arc<dyn Guardrail>>,
    handoff_target: Option<String>,
    behavior: Option<Arc<dyn Behavior>>,
}

impl AgentBuilder {
    pub fn behavior(mut self, behavior: impl Behavior + 'static) -> Self {
        self.behavior = Some(Arc::new(behavior));
        self
    }

    /// Use a closure as the behavior.
    pub fn behavior_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut RunState, &mut StageContext<'_>) -> Result<Payload, AgentExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.behavior(FnBehavior(f))
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn model(mut self, model: ModelDescriptor) -> Self {
        self.model = model;
        self
    }

    /// Tools to resolve from the registry at build time.
    pub fn uses<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// A tool owned by this agent alone, bypassing the registry.
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.direct_tools.push(Arc::new(tool));
        self
    }

    pub fn input_guardrail(mut self, guardrail: impl Guardrail + 'static) -> Self {
        self.input_guardrails.push(Arc::new(guardrail));
        self
    }

    pub fn output_guardrail(mut self, guardrail: impl Guardrail + 'static) -> Self {
        self.output_guardrails.push(Arc::new(guardrail));
        self
    }

    pub fn handoff(mut self, target: impl Into<String>) -> Self {
        self.handoff_target = Some(target.into());
        self
    }

    /// Resolve tool names against `registry`. Any name the registry does not
    /// know is a configuration error.
    pub fn build(self, registry: &ToolRegistry) -> Result<Agent, AgentExecutionError> {
        let mut tools = ToolSet::new();
        for name in &self.tool_names {
            let tool = registry
                .get(name)
                .ok_or_else(|| AgentExecutionError::ToolNotRegistered {
                    agent: self.name.clone(),
                    tool: name.clone(),
                })?;
            tools.insert(name.clone(), Arc::clone(tool));
        }
        for tool in self.direct_tools {
            tools.insert(tool.name().to_string(), tool);
        }

        Ok(Agent {
            name: self.name,
            instructions: self.instructions,
            model: self.model,
            tools,
            input_guardrails: self.input_guardrails,
            output_guardrails: self.output_guardrails,
            handoff_target: self.handoff_target,
            behavior: self
                .behavior
                .unwrap_or_else(|| Arc::new(Passthrough) as Arc<dyn Behavior>),
        })
    }
}
