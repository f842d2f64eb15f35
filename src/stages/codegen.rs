use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::agent::{Behavior, Payload, StageContext, payload};
use crate::error::AgentExecutionError;
use crate::state::RunState;
use crate::store::ArtifactKind;

use super::{capitalize, status_of, text, warn_on_error, write_output};

const GENERATED_DIR: &str = "src/generated/";
const PLAN_SUMMARY: &str = "docs/plan_summary.md";
const MANIFEST: &str = "MANIFEST.md";

const SYNTHESIS_INSTRUCTIONS: &str = "You are the CodeGeneration agent for AgentForge. \
Respond with JSON containing a `files` array. Each file needs `path` and `contents` keys. \
Prefer Python scaffolding when the requirements are ambiguous. \
Do not include explanations outside the JSON response.";

/// Writes the project scaffold for the normalized requirements.
///
/// Files come from the synthesis tool when it answers with `status: ok`,
/// otherwise one deterministic module per requirement is generated. A plan
/// summary and manifests are written on top, then a dry-run `git add`.
pub struct CodeGeneration;

impl Behavior for CodeGeneration {
    fn run(
        &self,
        state: &mut RunState,
        cx: &mut StageContext<'_>,
    ) -> Result<Payload, AgentExecutionError> {
        let out = state.output_dir().to_path_buf();
        let mut files: BTreeMap<String, String> = BTreeMap::new();

        let synthesized = synthesize(cx, state)?;
        if synthesized.is_empty() {
            for (path, contents) in fallback_files(&state.requirements) {
                write_output(cx, state, ArtifactKind::Code, &path, &contents)?;
                files.insert(path, contents);
            }
        } else {
            for (path, contents) in synthesized {
                write_output(cx, state, ArtifactKind::Code, &path, &contents)?;
                files.insert(path, contents);
            }
        }

        let plan = render_plan_summary(state.metadata.get("requirements"));
        if !plan.is_empty() {
            write_output(cx, state, ArtifactKind::Code, PLAN_SUMMARY, &plan)?;
            files.insert(PLAN_SUMMARY.to_string(), plan);
        }

        if !files.is_empty() {
            let root_manifest = manifest(files.keys());
            write_output(cx, state, ArtifactKind::Code, MANIFEST, &root_manifest)?;
            files.insert(MANIFEST.to_string(), root_manifest);

            let generated: Vec<&String> = files
                .keys()
                .filter(|p| p.starts_with(GENERATED_DIR))
                .collect();
            if !generated.is_empty() {
                let listing = manifest(generated);
                let path = format!("{GENERATED_DIR}{MANIFEST}");
                write_output(cx, state, ArtifactKind::Code, &path, &listing)?;
                files.insert(path, listing);
            }
        }

        let git = cx.call(
            "git_operations",
            json!({
                "command": "add -A",
                "dry_run": true,
                "cwd": out.display().to_string(),
            }),
        )?;
        warn_on_error(cx, "git_operations", &git);

        let count = files.len();
        let listing: Vec<String> = files.keys().cloned().collect();
        state.project_files = files;
        cx.event(format!("files_generated={count}"));
        cx.artifact("manifest", json!(listing));

        Ok(payload(json!({ "files_generated": count })))
    }
}

/// Ask the synthesis tool for files. Empty when it is offline, unconfigured or
/// returns nothing usable.
fn synthesize(
    cx: &mut StageContext<'_>,
    state: &RunState,
) -> Result<Vec<(String, String)>, AgentExecutionError> {
    let model = cx.model().name.clone();
    let response = cx.call(
        "code_synthesis",
        json!({
            "prompt": generation_prompt(state),
            "instructions": SYNTHESIS_INSTRUCTIONS,
            "model": model,
        }),
    )?;

    let status = status_of(&response).to_string();
    let entries = response
        .get("files")
        .and_then(Value::as_array)
        .filter(|files| !files.is_empty());
    let Some(entries) = entries.filter(|_| status == "ok") else {
        warn_on_error(cx, "code_synthesis", &response);
        cx.event(format!("codegen:model_status={status}"));
        return Ok(Vec::new());
    };

    cx.event("codegen:model=online");
    let files = entries
        .iter()
        .filter_map(|entry| {
            let path = ["path", "file", "name"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(Value::as_str))?;
            let contents = ["contents", "content"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(Value::as_str))?;
            let path = path.trim();
            (!path.is_empty()).then(|| (path.to_string(), contents.to_string()))
        })
        .collect();
    Ok(files)
}

fn generation_prompt(state: &RunState) -> String {
    let empty = Map::new();
    let meta = state
        .metadata
        .get("requirements")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let bullets = |key: &str, indent: &str| -> String {
        meta.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|i| format!("{indent}- {}", text(i)))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    };

    let project = state
        .metadata
        .get("project")
        .and_then(|p| p.get("name"))
        .map(text)
        .unwrap_or_else(|| "AgentForge Project".into());
    let overview = meta.get("overview").map(text).unwrap_or_default();
    let scope = meta
        .get("scope")
        .and_then(Value::as_object)
        .map(|scope| {
            scope
                .iter()
                .map(|(label, entries)| {
                    let lines = entries
                        .as_array()
                        .map(|e| {
                            e.iter()
                                .map(|x| format!("  - {}", text(x)))
                                .collect::<Vec<_>>()
                                .join("\n")
                        })
                        .unwrap_or_default();
                    format!("{}:\n{lines}", capitalize(label))
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    let requirements = state
        .requirements
        .iter()
        .map(|r| format!("- {r}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Project: {project}\nOverview:\n{overview}\n\nGoals:\n{goals}\n\nAssumptions:\n{assumptions}\n\n\
         Scope:\n{scope}\n\nNormalized Requirements:\n{requirements}\n\n\
         Generate code artifacts that satisfy the scope. Ensure the primary entrypoint is a CLI \
         that can orchestrate the agents.\nInclude README guidance and minimal tests mirroring \
         the generated modules.",
        goals = bullets("goals", ""),
        assumptions = bullets("assumptions", ""),
    )
}

/// One module per requirement plus the package `__init__.py`.
fn fallback_files(requirements: &[String]) -> Vec<(String, String)> {
    let mut files: Vec<(String, String)> = requirements
        .iter()
        .enumerate()
        .map(|(i, req)| {
            let path = format!("{GENERATED_DIR}{:02}_{}.py", i + 1, slugify(req));
            let literal = req.replace('\\', "\\\\").replace('"', "\\\"");
            let contents = format!(
                "\"\"\"Generated artifact for requirement: {req}\"\"\"\n\n\n\
                 def summary() -> str:\n    return \"{literal}\"\n"
            );
            (path, contents)
        })
        .collect();
    if !files.is_empty() {
        files.push((format!("{GENERATED_DIR}__init__.py"), "__all__ = []\n".into()));
    }
    files
}

/// Lower-case file-name slug: runs of non-alphanumerics become one `_`,
/// capped at 60 characters. Never empty.
pub fn slugify(name: &str) -> String {
    const MAX_LEN: usize = 60;

    let mapped: String = name
        .chars()
        .flat_map(|c| {
            let lowered: Vec<char> = if c.is_alphanumeric() {
                c.to_lowercase().collect()
            } else {
                vec!['_']
            };
            lowered
        })
        .collect();
    let mut slug = mapped
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.chars().count() > MAX_LEN {
        slug = slug.chars().take(MAX_LEN).collect::<String>().trim_end_matches('_').to_string();
    }
    if slug.is_empty() {
        "artifact".to_string()
    } else {
        slug
    }
}

fn render_plan_summary(requirements: Option<&Value>) -> String {
    let Some(meta) = requirements.and_then(Value::as_object) else {
        return String::new();
    };
    let list = |key: &str| -> Vec<String> {
        meta.get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().map(text).collect())
            .unwrap_or_default()
    };

    let mut lines: Vec<String> = vec!["# Plan Summary".into(), String::new()];
    if let Some(overview) = meta.get("overview").map(text).filter(|o| !o.is_empty()) {
        lines.extend(["## Overview".into(), overview.trim().to_string(), String::new()]);
    }
    for (section, key) in [("Goals", "goals"), ("Assumptions", "assumptions")] {
        let items = list(key);
        if !items.is_empty() {
            lines.push(format!("## {section}"));
            lines.extend(items.iter().map(|i| format!("- {i}")));
            lines.push(String::new());
        }
    }
    if let Some(scope) = meta.get("scope").and_then(Value::as_object) {
        lines.push("## Scope".into());
        for (label, entries) in scope {
            lines.push(format!("### {}", capitalize(label)));
            if let Some(entries) = entries.as_array() {
                lines.extend(entries.iter().map(|e| format!("- {}", text(e))));
            }
        }
        lines.push(String::new());
    }
    let stories = list("user_stories");
    if !stories.is_empty() {
        lines.push("## User Stories".into());
        lines.extend(stories.iter().map(|s| format!("- {s}")));
        lines.push(String::new());
    }

    lines
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn manifest<'a>(paths: impl IntoIterator<Item = &'a String>) -> String {
    paths
        .into_iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}
