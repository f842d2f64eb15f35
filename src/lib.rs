//! Sequential agent pipelines with guardrails, tracing and an auditable run
//! store.
//!
//! Register [`Agent`]s in an [`AgentRegistry`], hand it to a [`Runner`] with a
//! [`RunStore`], and run the handoff chain over a [`RunState`]. Every stage
//! attempt is written to the store as a `running` record before it starts and
//! a `completed`/`failed` record after, so interrupted runs are visible and
//! their artifacts can be rolled back.
//!
//! The [`stages`] module wires the standard five-stage code-generation
//! pipeline from a [`PipelineConfig`].
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use agentforge::{Agent, AgentRegistry, MemoryRunStore, RunState, Runner, ToolRegistry, payload};
//! use serde_json::json;
//!
//! let tools = ToolRegistry::new();
//! let greet = Agent::builder("Greet")
//!     .behavior_fn(|state, _cx| {
//!         state.requirements.push("say hello".into());
//!         Ok(payload(json!({"greeting": "hello"})))
//!     })
//!     .handoff("Done")
//!     .build(&tools)?;
//! let done = Agent::builder("Done").build(&tools)?;
//! let registry = AgentRegistry::builder().register(greet).register(done).build()?;
//!
//! let runner = Runner::new(Arc::new(registry), Arc::new(MemoryRunStore::new()));
//! let dir = std::env::temp_dir().join("agentforge-quickstart");
//! let mut state = RunState::new(dir.join("spec.json"), dir.join("out")).with_spec(json!({}));
//!
//! let result = runner.run("Greet", &mut state)?;
//! assert_eq!(result.agents_executed, ["Greet", "Done"]);
//! assert_eq!(result.steps.len(), 4);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod agent;
pub mod config;
mod error;
mod guardrail;
mod handoff;
pub mod logging;
pub mod parallel;
mod registry;
mod runner;
pub mod stages;
mod state;
pub mod store;
pub mod tools;
mod trace;

pub use agent::{
    Agent, AgentBuilder, AgentRunResult, Behavior, ModelDescriptor, Payload, StageContext, payload,
};
pub use config::{PersistencePolicy, PipelineConfig, StageFailurePolicy, load_config};
pub use error::{AgentExecutionError, PipelineError};
pub use guardrail::{FnGuardrail, Guardrail, Verdict, guardrail};
pub use handoff::determine_next_agent;
pub use parallel::{ParallelError, TaskFailure, run_in_parallel, run_pipelines};
pub use registry::{AgentRegistry, AgentRegistryBuilder, RegistryError};
pub use runner::{ErrorEvent, PipelineResult, Runner, StepEvent};
pub use state::{RunState, SpecError, StateSnapshot};
pub use store::{
    ArtifactKind, ArtifactRecord, MemoryRunStore, RollbackReport, RunRecord, RunStatus, RunStore,
    SqliteRunStore, StepRecord, StepStatus, StoreError,
};
pub use tools::{Tool, ToolError, ToolRegistry};
pub use trace::{Span, SpanGuard, SpanId, Tracer};
