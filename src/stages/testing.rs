use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Value, json};

use crate::agent::{Behavior, Payload, StageContext, payload};
use crate::error::AgentExecutionError;
use crate::state::RunState;
use crate::store::ArtifactKind;

use super::{warn_on_error, write_output};

const TEST_DIR: &str = "tests/generated";
const COVERAGE_TARGET: f64 = 85.0;

/// Generates a parametrized pytest module over the generated Python files and
/// runs the pytest and coverage tools against it.
pub struct Testing;

impl Behavior for Testing {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        let out = state.output_dir().to_path_buf();
        let test_file = format!("{TEST_DIR}/test_requirements.py");
        let init_file = format!("{TEST_DIR}/__init__.py");

        let content = render_test_module(state.project_files.keys());
        write_output(cx, state, ArtifactKind::Test, &init_file, "__all__ = []\n")?;
        write_output(cx, state, ArtifactKind::Test, &test_file, &content)?;
        state.test_suite = BTreeMap::from([(test_file, content)]);

        let pytest = cx.call(
            "pytest_runner",
            json!({ "target": TEST_DIR, "cwd": out.display().to_string() }),
        )?;
        warn_on_error(cx, "pytest_runner", &pytest);
        let coverage = cx.call(
            "coverage_analyzer",
            json!({ "coverage_target": COVERAGE_TARGET }),
        )?;
        warn_on_error(cx, "coverage_analyzer", &coverage);

        cx.event("tests_generated=1");
        cx.artifact("pytest", Value::Object(pytest));
        cx.artifact("coverage", Value::Object(coverage));

        Ok(payload(json!({ "tests": "generated" })))
    }
}

/// Python module names for the generated `.py` files, package markers excluded.
fn module_names<'a>(paths: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    paths
        .into_iter()
        .filter(|p| p.ends_with(".py"))
        .filter_map(|p| Path::new(p).file_stem()?.to_str().map(str::to_string))
        .filter(|stem| stem != "__init__")
        .map(|stem| format!("'generated.{stem}'"))
        .collect()
}

fn render_test_module<'a>(paths: impl IntoIterator<Item = &'a String>) -> String {
    let mut modules = module_names(paths);
    if modules.is_empty() {
        modules.push("'generated.placeholder'".into());
    }
    let list = modules
        .iter()
        .map(|m| format!("    {m}"))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        "import importlib\nimport pytest\n\n\n\
         @pytest.mark.parametrize(\"module_name\", [\n{list}\n])\n\
         def test_summary_matches_requirement(module_name):\n    \
         module = importlib.import_module(module_name)\n    \
         assert isinstance(module.summary(), str)\n    \
         assert module.summary()\n"
    )
}
