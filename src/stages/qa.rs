use std::sync::Arc;

use serde_json::{Value, json};

use crate::agent::{Behavior, Payload, StageContext, payload};
use crate::error::AgentExecutionError;
use crate::parallel::run_in_parallel;
use crate::state::RunState;
use crate::store::ArtifactKind;
use crate::tools::{Tool, ToolError};

use super::{status_of, write_output};

const REPORT_PATH: &str = "reports/qa_report.json";

/// Report name, tool, target.
const CHECKS: [(&str, &str, &str); 4] = [
    ("ruff", "ruff_checker", "src"),
    ("mypy", "mypy_validator", "src"),
    ("bandit", "bandit_scanner", "src"),
    ("safety", "safety_checker", "requirements.txt"),
];

/// Runs the static-analysis and dependency checks side by side.
///
/// The checks only read the output directory, so they fan out on the worker
/// pool and are joined before any state is written.
pub struct QualityAssurance {
    max_workers: usize,
}

impl QualityAssurance {
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers }
    }
}

impl Behavior for QualityAssurance {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        let out = state.output_dir().to_path_buf();
        let cwd = out.display().to_string();

        let tasks = CHECKS
            .iter()
            .map(|(_, tool, target)| {
                let tool: Arc<dyn Tool> = Arc::clone(cx.tool(tool)?);
                let args = payload(json!({ "target": target, "cwd": cwd }));
                Ok(move || tool.execute(&args))
            })
            .collect::<Result<Vec<_>, AgentExecutionError>>()?;

        let results = run_in_parallel(tasks, self.max_workers).map_err(|err| {
            AgentExecutionError::Tool {
                agent: cx.agent_name().to_string(),
                tool: "qa_checks".into(),
                source: ToolError::other(err.to_string()),
            }
        })?;

        let mut failed = Vec::new();
        for ((name, _, _), result) in CHECKS.iter().zip(results) {
            let status = status_of(&result);
            if matches!(status, "failed" | "error") {
                failed.push(*name);
                cx.warn(format!("{name}: {status}"));
            }
            cx.artifact(*name, Value::Object(result.clone()));
            state.qa_reports.insert(name.to_string(), Value::Object(result));
        }

        let report = serde_json::to_string_pretty(&state.qa_reports).map_err(|err| {
            AgentExecutionError::behavior(cx.agent_name(), format!("serialize qa report: {err}"))
        })?;
        write_output(cx, state, ArtifactKind::Report, REPORT_PATH, &report)?;

        cx.event(format!("qa_checks={}", CHECKS.len()));
        let status = if failed.is_empty() { "passed" } else { "failed" };
        tracing::debug!(status, ?failed, "quality checks joined");

        Ok(payload(json!({ "status": status, "failed": failed })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::QUALITY_ASSURANCE;
    use crate::stages::test_support::{offline_agents, seeded_state};
    use crate::tools::{FileWriter, ToolRegistry};

    struct Fixed {
        name: &'static str,
        status: &'static str,
    }

    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
            Ok(payload(json!({"status": self.status, "target": args["target"]})))
        }
    }

    #[test]
    fn offline_checks_are_skipped_and_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path(), json!({}));

        let result = offline_agents()
            .get(QUALITY_ASSURANCE)
            .unwrap()
            .run(&mut state)
            .unwrap();

        assert_eq!(result.output["status"], "passed");
        assert_eq!(
            state.qa_reports.keys().collect::<Vec<_>>(),
            vec!["bandit", "mypy", "ruff", "safety"]
        );
        assert_eq!(state.qa_reports["safety"]["target"], "requirements.txt");

        let written = std::fs::read_to_string(state.output_dir().join(REPORT_PATH)).unwrap();
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["ruff"]["status"], "skipped");
        assert!(
            state
                .artifact_paths()
                .iter()
                .any(|(kind, _)| *kind == ArtifactKind::Report)
        );
    }

    #[test]
    fn failing_check_marks_status_failed() {
        let tools = ToolRegistry::new()
            .register(FileWriter)
            .register(Fixed { name: "ruff_checker", status: "passed" })
            .register(Fixed { name: "mypy_validator", status: "failed" })
            .register(Fixed { name: "bandit_scanner", status: "passed" })
            .register(Fixed { name: "safety_checker", status: "error" });
        let agent = Agent::builder("QA")
            .uses(["ruff_checker", "mypy_validator", "bandit_scanner", "safety_checker", "file_writer"])
            .behavior(QualityAssurance::new(2))
            .build(&tools)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path(), json!({}));
        let result = agent.run(&mut state).unwrap();

        assert_eq!(result.output["status"], "failed");
        assert_eq!(result.output["failed"], json!(["mypy", "safety"]));
        assert_eq!(result.warnings, vec!["mypy: failed", "safety: error"]);
    }

    #[test]
    fn missing_check_tool_fails_loudly() {
        let tools = ToolRegistry::new().register(FileWriter);
        let agent = Agent::builder("QA")
            .uses(["file_writer"])
            .behavior(QualityAssurance::new(2))
            .build(&tools)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path(), json!({}));
        assert!(matches!(
            agent.run(&mut state),
            Err(AgentExecutionError::ToolNotRegistered { ref tool, .. }) if tool == "ruff_checker"
        ));
    }
}
