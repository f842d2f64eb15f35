//! Append-only run and step history, plus artifact rollback.
//!
//! Two backends ship with the crate: [`MemoryRunStore`] for tests and
//! embedding, and [`SqliteRunStore`] for the CLI. Both serialize writes
//! internally so concurrent runs can share one store.

mod memory;
mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("step {sequence} of run {run_id} already recorded")]
    DuplicateStep { run_id: Uuid, sequence: u32 },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    RolledBack,
}

text_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    RolledBack => "rolled_back",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(StepStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// What a recorded artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Code,
    Test,
    Doc,
    Report,
}

text_enum!(ArtifactKind {
    Code => "code",
    Test => "test",
    Doc => "doc",
    Report => "report",
});

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub spec_path: String,
    pub output_dir: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl RunRecord {
    pub fn started(run_id: Uuid, spec_path: &Path, output_dir: &Path) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            spec_path: spec_path.display().to_string(),
            output_dir: output_dir.display().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// One stage attempt. Identity is `(run_id, sequence)`; never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub sequence: u32,
    pub agent_name: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    /// Written before a stage starts.
    pub fn running(run_id: Uuid, sequence: u32, agent: &str, input: Value, retries: u32) -> Self {
        Self {
            run_id,
            sequence,
            agent_name: agent.to_string(),
            status: StepStatus::Running,
            input,
            output: None,
            error: None,
            retries,
            duration_ms: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// The closing record for `self`, taking the next sequence number.
    pub fn finish(
        &self,
        sequence: u32,
        outcome: Result<Value, String>,
        duration_ms: f64,
    ) -> Self {
        let (status, output, error) = match outcome {
            Ok(output) => (StepStatus::Completed, Some(output), None),
            Err(error) => (StepStatus::Failed, None, Some(error)),
        };
        Self {
            run_id: self.run_id,
            sequence,
            agent_name: self.agent_name.clone(),
            status,
            input: self.input.clone(),
            output,
            error,
            retries: self.retries,
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub run_id: Uuid,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

/// What a rollback actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub removed: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

/// Persistence backend for run, step and artifact records.
///
/// Implementations must serialize writes internally; one store is shared by
/// every concurrent run in the process.
pub trait RunStore: Send + Sync {
    /// Create tables if needed. Safe to call on every start.
    fn init_schema(&self) -> Result<(), StoreError>;

    fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Append a batch of step records, all or nothing.
    fn append_steps(&self, steps: &[StepRecord]) -> Result<(), StoreError>;

    /// Steps of one run ordered by sequence.
    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    /// Record artifact paths. Re-recording a path for the same run is a no-op.
    fn record_artifacts(&self, artifacts: &[ArtifactRecord]) -> Result<(), StoreError>;

    fn artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, StoreError>;

    /// Delete a run's artifacts from disk and mark it `rolled_back`.
    ///
    /// Paths that are already gone are reported as missing, not as errors.
    fn rollback(&self, run_id: Uuid) -> Result<RollbackReport, StoreError> {
        if self.run(run_id)?.is_none() {
            return Err(StoreError::RunNotFound(run_id));
        }

        let mut report = RollbackReport::default();
        for artifact in self.artifacts(run_id)? {
            if remove_path(&artifact.path)? {
                report.removed.push(artifact.path);
            } else {
                report.missing.push(artifact.path);
            }
        }

        self.set_run_status(run_id, RunStatus::RolledBack, Some(Utc::now()))?;
        tracing::info!(
            %run_id,
            removed = report.removed.len(),
            missing = report.missing.len(),
            "run rolled back"
        );
        Ok(report)
    }
}

/// Remove a file or directory tree. `Ok(false)` when nothing was there.
fn remove_path(path: &Path) -> Result<bool, StoreError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
