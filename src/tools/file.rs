use std::path::{Component, Path, PathBuf};

use serde_json::json;

use crate::agent::{Payload, payload};
use crate::tools::{Tool, ToolError, arg_str};

/// Write `contents` to `path`, creating parent directories as needed.
pub fn write_file(path: &Path, contents: &str) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::write(path, contents)?)
}

/// Join a relative artifact path onto `base`, refusing anything that would
/// land outside it.
pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let rel = Path::new(relative);
    if relative.trim().is_empty() {
        return Err(ToolError::invalid("empty path"));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ToolError::invalid(format!(
                    "path must stay under the output directory: {relative}"
                )));
            }
        }
    }
    Ok(base.join(rel))
}

/// Persists generated artifacts under a run's output directory.
///
/// Args: `path` (relative), `contents`, `base_dir`.
pub struct FileWriter;

impl Tool for FileWriter {
    fn name(&self) -> &str {
        "file_writer"
    }

    fn execute(&self, args: &Payload) -> Result<Payload, ToolError> {
        let base = arg_str(args, "base_dir")?;
        let relative = arg_str(args, "path")?;
        let contents = arg_str(args, "contents")?;

        let target = resolve_under(Path::new(base), relative)?;
        write_file(&target, contents)?;
        tracing::debug!(path = %target.display(), bytes = contents.len(), "artifact written");

        Ok(payload(json!({
            "path": target.display().to_string(),
            "bytes": contents.len(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(base: &Path, path: &str, contents: &str) -> Payload {
        payload(json!({
            "base_dir": base.display().to_string(),
            "path": path,
            "contents": contents,
        }))
    }

    #[test]
    fn writes_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileWriter
            .execute(&args(dir.path(), "src/generated/a.py", "x = 1\n"))
            .unwrap();

        let written = dir.path().join("src/generated/a.py");
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "x = 1\n");
        assert_eq!(out["path"], written.display().to_string());
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWriter
            .execute(&args(dir.path(), "../outside.txt", ""))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));

        let err = FileWriter
            .execute(&args(dir.path(), "/etc/passwd", ""))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[test]
    fn missing_argument_is_invalid() {
        let err = FileWriter.execute(&Payload::new()).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
