use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::agent::Payload;
use crate::store::ArtifactKind;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("read spec {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse spec {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
}

/// The mutable record threaded through one pipeline execution.
///
/// Owned by exactly one run. Stages write the business fields; the runner
/// only appends to the history log.
#[derive(Debug, Clone)]
pub struct RunState {
    spec_path: PathBuf,
    output_dir: PathBuf,
    spec: Option<Value>,
    pub requirements: Vec<String>,
    /// Generated source files, relative path → contents.
    pub project_files: BTreeMap<String, String>,
    /// Generated tests, relative path → contents.
    pub test_suite: BTreeMap<String, String>,
    /// Generated documentation, relative path → contents.
    pub documentation: BTreeMap<String, String>,
    /// Quality check name → result.
    pub qa_reports: BTreeMap<String, Value>,
    /// Cross-stage context, conventionally one entry per stage or topic.
    pub metadata: Map<String, Value>,
    history: Vec<String>,
    claimed: Vec<(ArtifactKind, String)>,
}

impl RunState {
    pub fn new(spec_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec_path: spec_path.into(),
            output_dir: output_dir.into(),
            spec: None,
            requirements: Vec::new(),
            project_files: BTreeMap::new(),
            test_suite: BTreeMap::new(),
            documentation: BTreeMap::new(),
            qa_reports: BTreeMap::new(),
            metadata: Map::new(),
            history: Vec::new(),
            claimed: Vec::new(),
        }
    }

    /// Seed an already parsed spec so it is never read from disk.
    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn spec_path(&self) -> &Path {
        &self.spec_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The parsed spec, loading and caching it on first access.
    ///
    /// `.toml` files are parsed as TOML, everything else as JSON.
    pub fn spec(&mut self) -> Result<&mut Value, SpecError> {
        let spec = match self.spec.take() {
            Some(spec) => spec,
            None => {
                let parsed = load_spec(&self.spec_path)?;
                tracing::debug!(path = %self.spec_path.display(), "spec loaded");
                parsed
            }
        };
        Ok(self.spec.insert(spec))
    }

    /// The spec if it has been loaded or seeded already.
    pub fn loaded_spec(&self) -> Option<&Value> {
        self.spec.as_ref()
    }

    pub fn record_history(&mut self, msg: impl Into<String>) {
        self.history.push(msg.into());
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Read-only view handed to guardrails and written into step records.
    ///
    /// File maps are reduced to their paths to keep records small.
    pub fn input_payload(&self) -> Payload {
        let keys = |m: &BTreeMap<String, String>| m.keys().cloned().collect::<Vec<_>>();
        let mut p = Payload::new();
        p.insert(
            "spec_path".into(),
            json!(self.spec_path.display().to_string()),
        );
        p.insert(
            "output_dir".into(),
            json!(self.output_dir.display().to_string()),
        );
        p.insert("spec_loaded".into(), json!(self.spec.is_some()));
        p.insert("requirements".into(), json!(self.requirements));
        p.insert("project_files".into(), json!(keys(&self.project_files)));
        p.insert("test_suite".into(), json!(keys(&self.test_suite)));
        p.insert("documentation".into(), json!(keys(&self.documentation)));
        p.insert(
            "qa_reports".into(),
            json!(self.qa_reports.keys().collect::<Vec<_>>()),
        );
        p.insert("metadata".into(), Value::Object(self.metadata.clone()));
        p
    }

    /// Detached copy of the business fields.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            requirements: self.requirements.clone(),
            project_files: self.project_files.clone(),
            test_suite: self.test_suite.clone(),
            documentation: self.documentation.clone(),
            qa_reports: self.qa_reports.clone(),
            metadata: self.metadata.clone(),
            history: self.history.clone(),
        }
    }

    /// Register a written file that none of the file maps track, so rollback
    /// can find it.
    pub fn claim_artifact(&mut self, kind: ArtifactKind, relative: impl Into<String>) {
        let relative = relative.into();
        if !self.claimed.iter().any(|(_, p)| *p == relative) {
            self.claimed.push((kind, relative));
        }
    }

    /// Every generated file this run has claimed, resolved against the output
    /// directory. Each path appears once; the file maps decide its kind.
    pub fn artifact_paths(&self) -> Vec<(ArtifactKind, PathBuf)> {
        let groups = [
            (ArtifactKind::Code, &self.project_files),
            (ArtifactKind::Test, &self.test_suite),
            (ArtifactKind::Doc, &self.documentation),
        ];
        let mut paths: Vec<(ArtifactKind, PathBuf)> = groups
            .into_iter()
            .flat_map(|(kind, files)| {
                files
                    .keys()
                    .map(move |rel| (kind, self.output_dir.join(rel)))
            })
            .collect();
        for (kind, rel) in &self.claimed {
            let path = self.output_dir.join(rel);
            if !paths.iter().any(|(_, known)| *known == path) {
                paths.push((*kind, path));
            }
        }
        paths
    }
}

fn load_spec(path: &Path) -> Result<Value, SpecError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SpecError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        toml::from_str::<Value>(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Value>(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| SpecError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Read-only projection of a [`RunState`] returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub requirements: Vec<String>,
    pub project_files: BTreeMap<String, String>,
    pub test_suite: BTreeMap<String, String>,
    pub documentation: BTreeMap<String, String>,
    pub qa_reports: BTreeMap<String, Value>,
    pub metadata: Map<String, Value>,
    pub history: Vec<String>,
}
