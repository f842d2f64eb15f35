use serde_json::{Map, Value, json};

use crate::agent::{Behavior, Payload, StageContext, payload};
use crate::error::AgentExecutionError;
use crate::state::RunState;

use super::{capitalize, text};

/// Used when a spec carries no requirements at all.
pub const DEFAULT_REQUIREMENT: &str = "No explicit requirements; proceed with defaults.";

const DEFAULT_PROJECT_NAME: &str = "AgentForge Project";

/// Loads the spec, validates it and extracts normalized requirements.
///
/// Writes `requirements`, `metadata.requirements`, `metadata.requirements_raw`
/// and `metadata.project`.
pub struct RequirementsAnalysis;

impl Behavior for RequirementsAnalysis {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        let agent = cx.agent_name().to_string();
        let spec_error = |source| AgentExecutionError::Spec {
            agent: agent.clone(),
            source,
        };
        let spec = state.spec().map_err(spec_error)?.clone();

        let validation = cx.call("schema_validator", json!({ "document": spec }))?;
        let warnings: Vec<String> = validation
            .get("warnings")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(text).collect())
            .unwrap_or_default();
        cx.event(format!("requirements:validators={}", warnings.len()));
        for warning in warnings {
            cx.warn(warning);
        }

        let raw = spec.get("requirements").cloned().unwrap_or(json!([]));
        let (mut requirements, metadata) = normalize_requirements(&raw);
        if requirements.is_empty() {
            requirements.push(DEFAULT_REQUIREMENT.to_string());
        }
        tracing::debug!(count = requirements.len(), "requirements normalized");

        let overview = metadata.get("overview").map(text);
        let project = project_info(&spec, overview.as_deref());

        state.requirements = requirements.clone();
        let described = if metadata.is_empty() {
            json!({ "items": requirements })
        } else {
            Value::Object(metadata)
        };
        state.metadata.insert("requirements".into(), described);
        state.metadata.insert("requirements_raw".into(), raw);
        state.metadata.insert("project".into(), Value::Object(project.clone()));
        if let Value::Object(doc) = state.spec().map_err(spec_error)? {
            doc.insert("project".into(), Value::Object(project.clone()));
        }

        let query = project
            .get("name")
            .map(text)
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());
        let research = cx.call("research_tool", json!({ "query": query }))?;
        let matches = research
            .get("matches")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        cx.event(format!("research:matches={matches}"));
        cx.artifact("research", Value::Object(research));

        Ok(payload(json!({
            "summary": project.get("summary").map(text).unwrap_or_default(),
            "requirements_count": requirements.len(),
        })))
    }
}

/// `spec.project` with `name` and `summary` filled in.
fn project_info(spec: &Value, overview: Option<&str>) -> Map<String, Value> {
    let mut project = spec
        .get("project")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let name = project
        .get("name")
        .filter(|v| truthy(v))
        .or_else(|| spec.get("name").filter(|v| truthy(v)))
        .map(text)
        .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());

    let has_summary = project.get("summary").is_some_and(truthy);
    if let Some(overview) = overview.filter(|o| !o.is_empty())
        && !has_summary
    {
        project.insert("summary".into(), json!(overview));
    }
    project.entry("name").or_insert(json!(name));
    project
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn trimmed_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|v| text(v).trim().to_string()).collect())
        .unwrap_or_default()
}

/// Flatten the spec's `requirements` into labelled strings.
///
/// Accepts a list (strings or `{id, description}` objects), a structured
/// object, or a scalar. The returned map keeps the structured parts for later
/// stages and is empty for list and scalar input.
pub fn normalize_requirements(raw: &Value) -> (Vec<String>, Map<String, Value>) {
    let mut normalized = Vec::new();
    let mut metadata = Map::new();

    match raw {
        Value::Object(obj) => {
            let extend = |normalized: &mut Vec<String>, prefix: &str, values: &[String]| {
                normalized.extend(values.iter().map(|v| format!("{prefix}: {}", v.trim())));
            };

            if let Some(overview) = obj.get("overview").filter(|v| truthy(v)) {
                let overview = text(overview);
                normalized.push(format!("Overview: {}", overview.trim()));
                metadata.insert("overview".into(), json!(overview));
            }

            let goals = trimmed_list(obj.get("goals"));
            if !goals.is_empty() {
                extend(&mut normalized, "Goal", &goals);
                metadata.insert("goals".into(), json!(goals));
            }

            let assumptions = trimmed_list(obj.get("assumptions"));
            if !assumptions.is_empty() {
                extend(&mut normalized, "Assumption", &assumptions);
                metadata.insert("assumptions".into(), json!(assumptions));
            }

            if let Some(scope) = obj.get("scope").and_then(Value::as_object) {
                let mut described = Map::new();
                for (key, items) in scope {
                    let entries = trimmed_list(Some(items));
                    extend(&mut normalized, &format!("Scope-{key}"), &entries);
                    described.insert(key.clone(), json!(entries));
                }
                metadata.insert("scope".into(), Value::Object(described));
            }

            let stories: Vec<String> = obj
                .get("user_stories")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(user_story).collect())
                .unwrap_or_default();
            if !stories.is_empty() {
                extend(&mut normalized, "UserStory", &stories);
                metadata.insert("user_stories".into(), json!(stories));
            }

            const HANDLED: [&str; 5] = ["overview", "goals", "assumptions", "scope", "user_stories"];
            for (key, value) in obj.iter().filter(|(k, _)| !HANDLED.contains(&k.as_str())) {
                match value {
                    Value::Array(_) => {
                        let entries: Vec<String> = trimmed_list(Some(value))
                            .into_iter()
                            .filter(|e| !e.is_empty())
                            .collect();
                        if !entries.is_empty() {
                            extend(&mut normalized, &capitalize(key), &entries);
                            metadata.insert(key.clone(), json!(entries));
                        }
                    }
                    Value::Object(_) => {
                        metadata.insert(key.clone(), value.clone());
                    }
                    other if truthy(other) => {
                        let value = text(other);
                        normalized.push(format!("{}: {value}", capitalize(key)));
                        metadata.insert(key.clone(), json!(value));
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let line = match item {
                    Value::Object(req) => format!(
                        "{}: {}",
                        req.get("id").map(text).unwrap_or_else(|| "R?".into()),
                        req.get("description").map(text).unwrap_or_default().trim()
                    ),
                    other => text(other),
                };
                normalized.push(line);
            }
        }
        other if truthy(other) => normalized.push(text(other)),
        _ => {}
    }

    (normalized, metadata)
}

fn user_story(story: &Value) -> String {
    let Some(obj) = story.as_object() else {
        return text(story);
    };
    let field = |key: &str| obj.get(key).map(text).unwrap_or_default().trim().to_string();
    let role = obj.get("role").map(text).unwrap_or_else(|| "User".into());
    let mut summary = format!("{role}: {}", field("goal"));
    let reason = field("reason");
    if !reason.is_empty() {
        summary.push_str(&format!(" (so that {reason})"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REQUIREMENTS;
    use crate::stages::test_support::{offline_agents, seeded_state};

    #[test]
    fn list_requirements_keep_order_and_ids() {
        let (reqs, meta) = normalize_requirements(&json!([
            "Create tasks",
            {"id": "R2", "description": "  Assign owners "},
            {"description": "Track status"},
        ]));
        assert_eq!(reqs, vec!["Create tasks", "R2: Assign owners", "R?: Track status"]);
        assert!(meta.is_empty());
    }

    #[test]
    fn structured_requirements_are_labelled() {
        let (reqs, meta) = normalize_requirements(&json!({
            "overview": "A task tracker",
            "goals": ["Fast", " Simple "],
            "scope": {"in": ["CLI"], "out": ["Web UI"]},
            "user_stories": [
                {"role": "Manager", "goal": "see progress", "reason": "plan sprints"},
                {"goal": "log in"},
                "raw story"
            ],
            "constraints": ["offline first", ""],
            "priority": "high",
            "nested": {"a": 1},
        }));

        assert_eq!(
            reqs,
            vec![
                "Overview: A task tracker",
                "Goal: Fast",
                "Goal: Simple",
                "Scope-in: CLI",
                "Scope-out: Web UI",
                "UserStory: Manager: see progress (so that plan sprints)",
                "UserStory: User: log in",
                "UserStory: raw story",
                "Constraints: offline first",
                "Priority: high",
            ]
        );
        assert_eq!(meta["overview"], "A task tracker");
        assert_eq!(meta["scope"], json!({"in": ["CLI"], "out": ["Web UI"]}));
        assert_eq!(meta["nested"], json!({"a": 1}));
        assert_eq!(meta["priority"], "high");
    }

    #[test]
    fn scalar_and_empty_inputs() {
        assert_eq!(normalize_requirements(&json!("just one")).0, vec!["just one"]);
        assert!(normalize_requirements(&json!("")).0.is_empty());
        assert!(normalize_requirements(&json!(null)).0.is_empty());
    }

    #[test]
    fn project_defaults_name_and_summary() {
        let p = project_info(&json!({}), Some("Overview text"));
        assert_eq!(p["name"], DEFAULT_PROJECT_NAME);
        assert_eq!(p["summary"], "Overview text");

        let p = project_info(&json!({"name": "Top", "project": {"summary": "kept"}}), Some("x"));
        assert_eq!(p["name"], "Top");
        assert_eq!(p["summary"], "kept");
    }

    #[test]
    fn stage_populates_state_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(
            dir.path(),
            json!({"project": {"name": "Tracker"}, "requirements": {"overview": "Track tasks", "goals": ["Fast"]}}),
        );

        let agents = offline_agents();
        let result = agents.get(REQUIREMENTS).unwrap().run(&mut state).unwrap();

        assert_eq!(state.requirements, vec!["Overview: Track tasks", "Goal: Fast"]);
        assert_eq!(state.metadata["project"]["summary"], "Track tasks");
        assert_eq!(state.loaded_spec().unwrap()["project"]["name"], "Tracker");
        assert_eq!(result.output["requirements_count"], 2);
        assert!(result.events.contains(&"requirements:validators=0".to_string()));
        assert!(result.events.contains(&"research:matches=0".to_string()));
        assert_eq!(result.artifacts["research"]["query"], "Tracker");
    }

    #[test]
    fn empty_spec_falls_back_to_default_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path(), json!({}));
        let result = offline_agents().get(REQUIREMENTS).unwrap().run(&mut state).unwrap();

        assert_eq!(state.requirements, vec![DEFAULT_REQUIREMENT]);
        assert_eq!(state.metadata["requirements"], json!({"items": [DEFAULT_REQUIREMENT]}));
        assert_eq!(result.warnings, vec!["missing keys: project, requirements"]);
        assert_eq!(result.artifacts["research"]["query"], DEFAULT_PROJECT_NAME);
    }
}
