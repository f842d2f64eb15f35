//! Process-wide pipeline configuration.
//!
//! Loaded once at startup from TOML, optionally adjusted from environment
//! variables, validated, and then shared read-only.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::ModelDescriptor;

pub const REQUIREMENTS: &str = "RequirementsAnalysis";
pub const CODE_GENERATION: &str = "CodeGeneration";
pub const TESTING: &str = "Testing";
pub const DOCUMENTATION: &str = "Documentation";
pub const QUALITY_ASSURANCE: &str = "QualityAssurance";

const ENV_PREFIX: &str = "AGENTFORGE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not a valid {expected}")]
    Env {
        var: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What the runner does when a run or step record cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistencePolicy {
    /// Log and keep going; the business pipeline is unaffected.
    #[default]
    Warn,
    /// Abort the run with [`crate::PipelineError::Persistence`].
    Fatal,
}

/// What the runner returns when a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageFailurePolicy {
    /// `Err(PipelineError::StageFailed)` carrying the failed result.
    #[default]
    Propagate,
    /// `Ok(result)` with `status = failed`.
    Report,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub role: String,
    pub instructions: String,
    pub model: ModelDescriptor,
    pub tools: Vec<String>,
    pub handoff_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".agentforge.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Attach the span export to every `PipelineResult`.
    pub tracing_enabled: bool,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// JSON log lines instead of compact text.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            tracing_enabled: true,
            log_level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Code synthesis endpoint. Without an endpoint the CodeGeneration stage
/// always uses its deterministic fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_secs: 60,
        }
    }
}

/// Root configuration (TOML).
///
/// Missing fields take their defaults. Supplying an `[agents]` table
/// replaces the standard five-stage set entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub offline: bool,
    pub start_agent: String,
    /// Guard against handoff cycles.
    pub max_steps: usize,
    /// Extra attempts for a stage that failed with a retryable error.
    pub max_retries: u32,
    pub on_persistence_failure: PersistencePolicy,
    pub on_stage_failure: StageFailurePolicy,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub parallel: ParallelConfig,
    pub synthesis: SynthesisConfig,
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            offline: false,
            start_agent: REQUIREMENTS.into(),
            max_steps: 64,
            max_retries: 0,
            on_persistence_failure: PersistencePolicy::default(),
            on_stage_failure: StageFailurePolicy::default(),
            database: DatabaseConfig::default(),
            observability: ObservabilityConfig::default(),
            parallel: ParallelConfig::default(),
            synthesis: SynthesisConfig::default(),
            agents: default_agents(),
        }
    }
}

fn stage(
    role: &str,
    model: &str,
    tools: &[&str],
    handoff_target: Option<&str>,
    instructions: &str,
) -> AgentConfig {
    AgentConfig {
        role: role.into(),
        instructions: instructions.into(),
        model: ModelDescriptor::named(model),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        handoff_target: handoff_target.map(str::to_string),
    }
}

/// The standard Requirements → CodeGeneration → Testing → Documentation →
/// QualityAssurance chain.
pub fn default_agents() -> BTreeMap<String, AgentConfig> {
    BTreeMap::from([
        (
            REQUIREMENTS.to_string(),
            stage(
                "analysis",
                "gpt-5",
                &["schema_validator", "research_tool"],
                Some(CODE_GENERATION),
                "Load the spec, validate its structure and extract actionable requirements.",
            ),
        ),
        (
            CODE_GENERATION.to_string(),
            stage(
                "codegen",
                "gpt-5-mini",
                &["file_writer", "git_operations", "code_synthesis"],
                Some(TESTING),
                "Respond with JSON containing a `files` array. Each file needs `path` and \
                 `contents` keys. Do not include explanations outside the JSON response.",
            ),
        ),
        (
            TESTING.to_string(),
            stage(
                "testing",
                "gpt-5-mini",
                &["pytest_runner", "coverage_analyzer", "file_writer"],
                Some(DOCUMENTATION),
                "Generate deterministic tests for the generated modules.",
            ),
        ),
        (
            DOCUMENTATION.to_string(),
            stage(
                "documentation",
                "gpt-5-mini",
                &["markdown_writer", "diagram_generator", "file_writer"],
                Some(QUALITY_ASSURANCE),
                "Produce a README and an agent flow diagram.",
            ),
        ),
        (
            QUALITY_ASSURANCE.to_string(),
            stage(
                "qa",
                "gpt-5-nano",
                &[
                    "ruff_checker",
                    "mypy_validator",
                    "bandit_scanner",
                    "safety_checker",
                    "file_writer",
                ],
                None,
                "Run static analysis and safety checks.",
            ),
        ),
    ])
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("at least one agent must be configured".into()));
        }
        if !self.agents.contains_key(&self.start_agent) {
            return Err(ConfigError::Invalid(format!(
                "start_agent '{}' is not a configured agent",
                self.start_agent
            )));
        }
        for (name, agent) in &self.agents {
            if let Some(target) = &agent.handoff_target
                && !self.agents.contains_key(target)
            {
                return Err(ConfigError::Invalid(format!(
                    "agent '{name}' hands off to unknown agent '{target}'"
                )));
            }
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be > 0".into()));
        }
        if self.parallel.max_workers == 0 {
            return Err(ConfigError::Invalid("parallel.max_workers must be > 0".into()));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `AGENTFORGE_*` overrides from an explicit variable list.
    ///
    /// Recognised: `OFFLINE`, `DB`, `LOG_LEVEL`, `LOG_JSON`, `TRACING`,
    /// `MAX_RETRIES`, and per agent `<AGENT>_MODEL` / `<AGENT>_REASONING`
    /// where `<AGENT>` is the agent name or its role, upper-cased.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(var) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            let full = key.as_ref();
            match var {
                "OFFLINE" => self.offline = parse_bool(full, &value)?,
                "DB" => self.database.path = PathBuf::from(value),
                "LOG_LEVEL" => self.observability.log_level = value,
                "LOG_JSON" => self.observability.json = parse_bool(full, &value)?,
                "TRACING" => self.observability.tracing_enabled = parse_bool(full, &value)?,
                "MAX_RETRIES" => {
                    self.max_retries = value.trim().parse().map_err(|_| ConfigError::Env {
                        var: full.to_string(),
                        value: value.clone(),
                        expected: "non-negative integer",
                    })?;
                }
                other => self.apply_agent_override(other, value),
            }
        }
        Ok(self)
    }

    fn apply_agent_override(&mut self, var: &str, value: String) {
        for (name, agent) in self.agents.iter_mut() {
            let keys = [name.to_ascii_uppercase(), agent.role.to_ascii_uppercase()];
            for key in keys.iter().filter(|k| !k.is_empty()) {
                if var == format!("{key}_MODEL") {
                    agent.model.name = value.clone();
                } else if var == format!("{key}_REASONING") {
                    agent.model.reasoning_effort = value.clone();
                }
            }
        }
    }
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: raw.to_string(),
            expected: "boolean",
        }),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: PipelineConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.agents.len(), 5);
    }

    #[test]
    fn default_chain_ends_at_quality_assurance() {
        let cfg = PipelineConfig::default();
        let mut current = Some(cfg.start_agent.clone());
        let mut chain = Vec::new();
        while let Some(name) = current {
            current = cfg.agents[&name].handoff_target.clone();
            chain.push(name);
        }
        assert_eq!(
            chain,
            vec![REQUIREMENTS, CODE_GENERATION, TESTING, DOCUMENTATION, QUALITY_ASSURANCE]
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentforge.toml");
        fs::write(
            &path,
            "offline = true\non_stage_failure = \"report\"\n[parallel]\nmax_workers = 2\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert!(cfg.offline);
        assert_eq!(cfg.on_stage_failure, StageFailurePolicy::Report);
        assert_eq!(cfg.parallel.max_workers, 2);
        assert_eq!(cfg.max_steps, 64);
        assert_eq!(cfg.agents.len(), 5);
    }

    #[test]
    fn custom_agents_replace_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentforge.toml");
        fs::write(
            &path,
            r#"
start_agent = "Only"

[agents.Only]
role = "solo"
tools = ["file_writer"]

[agents.Only.model]
name = "local"
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents["Only"].model.name, "local");
        assert_eq!(cfg.agents["Only"].model.reasoning_effort, "medium");
    }

    #[test]
    fn validate_rejects_unknown_handoff_and_start() {
        let mut cfg = PipelineConfig::default();
        cfg.start_agent = "Nope".into();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        if let Some(qa) = cfg.agents.get_mut(QUALITY_ASSURANCE) {
            qa.handoff_target = Some("Ghost".into());
        }
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut cfg = PipelineConfig::default();
        cfg.max_steps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.parallel.max_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = PipelineConfig::default()
            .with_env_overrides([
                ("AGENTFORGE_OFFLINE", "yes"),
                ("AGENTFORGE_DB", "/tmp/x.sqlite"),
                ("AGENTFORGE_MAX_RETRIES", "2"),
                ("AGENTFORGE_CODEGEN_MODEL", "local-coder"),
                ("AGENTFORGE_REQUIREMENTSANALYSIS_REASONING", "high"),
                ("UNRELATED", "1"),
            ])
            .unwrap();

        assert!(cfg.offline);
        assert_eq!(cfg.database.path, PathBuf::from("/tmp/x.sqlite"));
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.agents[CODE_GENERATION].model.name, "local-coder");
        assert_eq!(cfg.agents[REQUIREMENTS].model.reasoning_effort, "high");
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let err = PipelineConfig::default()
            .with_env_overrides([("AGENTFORGE_OFFLINE", "maybe")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { expected: "boolean", .. }));
    }
}
