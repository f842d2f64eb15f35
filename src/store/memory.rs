use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ArtifactRecord, RunRecord, RunStatus, RunStore, StepRecord, StoreError};

#[derive(Default)]
struct Inner {
    runs: BTreeMap<Uuid, RunRecord>,
    steps: Vec<StepRecord>,
    artifacts: Vec<ArtifactRecord>,
}

/// Process-local store. History is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl RunStore for MemoryRunStore {
    fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.lock()?.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.status = status;
        if finished_at.is_some() {
            run.finished_at = finished_at;
        }
        Ok(())
    }

    fn append_steps(&self, steps: &[StepRecord]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;

        // Validate the whole batch before touching the log.
        let mut seen: HashSet<(Uuid, u32)> = inner
            .steps
            .iter()
            .map(|s| (s.run_id, s.sequence))
            .collect();
        for step in steps {
            if !seen.insert((step.run_id, step.sequence)) {
                return Err(StoreError::DuplicateStep {
                    run_id: step.run_id,
                    sequence: step.sequence,
                });
            }
        }

        inner.steps.extend_from_slice(steps);
        Ok(())
    }

    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let mut steps: Vec<StepRecord> = self
            .lock()?
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }

    fn record_artifacts(&self, artifacts: &[ArtifactRecord]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for artifact in artifacts {
            let known = inner
                .artifacts
                .iter()
                .any(|a| a.run_id == artifact.run_id && a.path == artifact.path);
            if !known {
                inner.artifacts.push(artifact.clone());
            }
        }
        Ok(())
    }

    fn artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, StoreError> {
        Ok(self
            .lock()?
            .artifacts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }
}
