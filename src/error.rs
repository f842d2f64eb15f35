use std::path::PathBuf;

use thiserror::Error;

use crate::parallel::ParallelError;
use crate::runner::PipelineResult;
use crate::state::SpecError;
use crate::store::StoreError;
use crate::tools::ToolError;

/// Error raised by a single agent execution.
///
/// Variants are grouped by what the caller can do about them: configuration
/// mistakes (`ToolNotRegistered`) and guardrail rejections are never worth
/// retrying, tool failures sometimes are.
#[derive(Debug, Error)]
pub enum AgentExecutionError {
    /// The agent looked up a tool outside its configured set.
    #[error("tool '{tool}' not registered for {agent}")]
    ToolNotRegistered { agent: String, tool: String },

    /// An input guardrail rejected the stage before its behavior ran.
    #[error("input guardrail '{guardrail}' rejected {agent}: {}", .errors.join("; "))]
    InputGuardrail {
        agent: String,
        guardrail: String,
        errors: Vec<String>,
    },

    /// An output guardrail rejected what the behavior produced.
    #[error("output guardrail '{guardrail}' rejected {agent}: {}", .errors.join("; "))]
    OutputGuardrail {
        agent: String,
        guardrail: String,
        errors: Vec<String>,
    },

    /// A tool raised instead of reporting a status.
    #[error("tool '{tool}' failed in {agent}: {source}")]
    Tool {
        agent: String,
        tool: String,
        #[source]
        source: ToolError,
    },

    /// The run's spec document could not be loaded.
    #[error("{agent}: {source}")]
    Spec {
        agent: String,
        #[source]
        source: SpecError,
    },

    /// The behavior gave up for a reason of its own.
    #[error("{agent}: {message}")]
    Behavior { agent: String, message: String },
}

impl AgentExecutionError {
    /// Create a [`Behavior`](AgentExecutionError::Behavior) error.
    pub fn behavior(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Behavior {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Name of the agent that failed.
    pub fn agent(&self) -> &str {
        match self {
            Self::ToolNotRegistered { agent, .. }
            | Self::InputGuardrail { agent, .. }
            | Self::OutputGuardrail { agent, .. }
            | Self::Tool { agent, .. }
            | Self::Spec { agent, .. }
            | Self::Behavior { agent, .. } => agent,
        }
    }

    /// Guardrail reasons, verbatim, when this is a guardrail rejection.
    pub fn guardrail_errors(&self) -> Option<&[String]> {
        match self {
            Self::InputGuardrail { errors, .. } | Self::OutputGuardrail { errors, .. } => {
                Some(errors.as_slice())
            }
            _ => None,
        }
    }

    /// Only I/O and unexpected tool failures are worth another attempt; bad
    /// arguments fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Tool {
                source: ToolError::Io(_) | ToolError::Other(_),
                ..
            }
        )
    }
}

/// Error that ends a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The handoff chain named an agent the registry does not know.
    #[error("agent '{0}' not registered")]
    AgentNotRegistered(String),

    /// The step guard tripped, usually because of a handoff cycle.
    #[error("max_steps exceeded ({limit}) at agent '{agent}' (possible handoff cycle)")]
    MaxStepsExceeded { limit: usize, agent: String },

    /// A stage failed; `result` holds the failed run's aggregated result.
    #[error("stage '{agent}' failed: {source}")]
    StageFailed {
        agent: String,
        #[source]
        source: AgentExecutionError,
        result: Box<PipelineResult>,
    },

    #[error("preflight checks failed: {0}")]
    Preflight(#[from] ParallelError),

    #[error("run store: {0}")]
    Persistence(#[from] StoreError),

    #[error("prepare output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline worker panicked: {0}")]
    WorkerPanicked(String),
}

impl PipelineError {
    /// The failed run's result, when the failure happened inside a stage.
    pub fn result(&self) -> Option<&PipelineResult> {
        match self {
            Self::StageFailed { result, .. } => Some(&**result),
            _ => None,
        }
    }
}
