use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use uuid::Uuid;

use super::{
    ArtifactKind, ArtifactRecord, RunRecord, RunStatus, RunStore, StepRecord, StepStatus,
    StoreError,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    spec_path   TEXT NOT NULL,
    output_dir  TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS steps (
    run_id      TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    agent_name  TEXT NOT NULL,
    status      TEXT NOT NULL,
    input       TEXT NOT NULL,
    output      TEXT,
    error       TEXT,
    retries     INTEGER NOT NULL DEFAULT 0,
    duration_ms REAL NOT NULL DEFAULT 0,
    timestamp   TEXT NOT NULL,
    PRIMARY KEY (run_id, sequence)
);
CREATE TABLE IF NOT EXISTS artifacts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    path        TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (run_id, path)
);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts (run_id);
";

/// SQLite-backed store. One connection, writes serialized by a mutex.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open (creating parent directories) and initialise the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::debug!(path = %path.display(), "opened run store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl RunStore for SqliteRunStore {
    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&run.metadata)?;
        self.lock()?.execute(
            "INSERT INTO runs (run_id, status, spec_path, output_dir, started_at, finished_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                metadata = excluded.metadata",
            params![
                run.run_id.to_string(),
                run.status.as_str(),
                run.spec_path,
                run.output_dir,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                metadata,
            ],
        )?;
        Ok(())
    }

    fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT status, spec_path, output_dir, started_at, finished_at, metadata
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, spec_path, output_dir, started_at, finished_at, metadata)) = raw else {
            return Ok(None);
        };
        Ok(Some(RunRecord {
            run_id,
            status: status.parse()?,
            spec_path,
            output_dir,
            started_at: parse_time(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_time).transpose()?,
            metadata: serde_json::from_str(&metadata)?,
        }))
    }

    fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let changed = self.lock()?.execute(
            "UPDATE runs SET status = ?2, finished_at = COALESCE(?3, finished_at)
             WHERE run_id = ?1",
            params![
                run_id.to_string(),
                status.as_str(),
                finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn append_steps(&self, steps: &[StepRecord]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO steps
                    (run_id, sequence, agent_name, status, input, output, error, retries, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for step in steps {
                let output = step.output.as_ref().map(serde_json::to_string).transpose()?;
                stmt.execute(params![
                    step.run_id.to_string(),
                    step.sequence,
                    step.agent_name,
                    step.status.as_str(),
                    serde_json::to_string(&step.input)?,
                    output,
                    step.error,
                    step.retries,
                    step.duration_ms,
                    step.timestamp.to_rfc3339(),
                ])
                .map_err(|err| match err.sqlite_error_code() {
                    Some(ErrorCode::ConstraintViolation) => StoreError::DuplicateStep {
                        run_id: step.run_id,
                        sequence: step.sequence,
                    },
                    _ => StoreError::Sqlite(err),
                })?;
            }
        }
        // Dropping an uncommitted transaction rolls it back, so an error
        // above leaves no partial batch behind.
        tx.commit()?;
        Ok(())
    }

    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT sequence, agent_name, status, input, output, error, retries, duration_ms, timestamp
             FROM steps WHERE run_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut steps = Vec::new();
        for row in rows {
            let (sequence, agent_name, status, input, output, error, retries, duration_ms, ts) =
                row?;
            steps.push(StepRecord {
                run_id,
                sequence,
                agent_name,
                status: status.parse::<StepStatus>()?,
                input: serde_json::from_str(&input)?,
                output: output.as_deref().map(serde_json::from_str).transpose()?,
                error,
                retries,
                duration_ms,
                timestamp: parse_time(&ts)?,
            });
        }
        Ok(steps)
    }

    fn record_artifacts(&self, artifacts: &[ArtifactRecord]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO artifacts (run_id, kind, path, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for artifact in artifacts {
                stmt.execute(params![
                    artifact.run_id.to_string(),
                    artifact.kind.as_str(),
                    artifact.path.display().to_string(),
                    artifact.recorded_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT kind, path, recorded_at FROM artifacts WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut artifacts = Vec::new();
        for row in rows {
            let (kind, path, recorded_at) = row?;
            artifacts.push(ArtifactRecord {
                run_id,
                kind: kind.parse::<ArtifactKind>()?,
                path: PathBuf::from(path),
                recorded_at: parse_time(&recorded_at)?,
            });
        }
        Ok(artifacts)
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp '{raw}': {err}")))
}
