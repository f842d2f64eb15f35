use std::path::{Path, PathBuf};

use serde_json::json;

use crate::agent::{Payload, payload};
use crate::tools::{Tool, ToolError, arg_str};

/// Offline research helper: surfaces local markdown documents that mention
/// the query.
///
/// Args: `query`. Returns `{query, matches: ["file.md: query", ...], mode}`.
pub struct ResearchTool {
    docs_root: PathBuf,
}

impl ResearchTool {
    pub fn new(docs_root: impl Into<PathBuf>) -> Self {
        Self {
            docs_root: docs_root.into(),
        }
    }
}

impl Tool for ResearchTool {
    fn name(&self) -> &str {
        "research_tool"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        let query = arg_str(args, "query")?;
        let needle = query.to_lowercase();

        let mut matches = Vec::new();
        if self.docs_root.is_dir() {
            for path in find_files(&self.docs_root, ".md")? {
                let text = std::fs::read_to_string(&path)?;
                if text.to_lowercase().contains(&needle) {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    matches.push(format!("{name}: {query}"));
                }
            }
        }
        matches.sort();

        Ok(payload(json!({
            "query": query,
            "matches": matches,
            "mode": "offline",
        })))
    }
}

fn find_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, ToolError> {
    let mut results = Vec::new();
    find_files_recursive(dir, suffix, &mut results)?;
    Ok(results)
}

fn find_files_recursive(
    dir: &Path,
    suffix: &str,
    results: &mut Vec<PathBuf>,
) -> Result<(), ToolError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        // Symlinked directories are not followed.
        if entry.file_type()?.is_dir() {
            find_files_recursive(&path, suffix, results)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.ends_with(suffix)
        {
            results.push(path);
        }
    }
    Ok(())
}
