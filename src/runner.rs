use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::agent::{Agent, AgentRunResult, Payload};
use crate::config::{PersistencePolicy, PipelineConfig, StageFailurePolicy};
use crate::error::{AgentExecutionError, PipelineError};
use crate::handoff::determine_next_agent;
use crate::parallel::run_in_parallel;
use crate::registry::AgentRegistry;
use crate::state::{RunState, StateSnapshot};
use crate::store::{ArtifactRecord, RunRecord, RunStatus, RunStore, StepRecord, StoreError};
use crate::trace::Tracer;

/// Passed to the `on_step` hook after each successful stage.
pub struct StepEvent<'a> {
    pub run_id: Uuid,
    pub agent: &'a str,
    pub result: &'a AgentRunResult,
    pub duration: Duration,
    pub step_number: usize,
    pub retries: u32,
}

/// Passed to the `on_error` hook when a stage fails or the run is aborted.
pub struct ErrorEvent<'a> {
    pub run_id: Uuid,
    pub agent: &'a str,
    pub error: &'a (dyn std::error::Error + 'static),
    pub step_number: usize,
}

type StepHook = Box<dyn Fn(&StepEvent<'_>) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&ErrorEvent<'_>) + Send + Sync>;
type PreflightCheck = Box<dyn Fn(&RunState) -> Result<(), String> + Send + Sync>;

/// Aggregated outcome of one pipeline run.
///
/// Everything here is a detached copy; nothing points back into the run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    /// `Completed` or `Failed`.
    pub status: RunStatus,
    /// Stages that completed, in execution order.
    pub agents_executed: Vec<String>,
    /// Sum of stage span durations.
    pub duration_ms: f64,
    /// Every step record written for this run.
    pub steps: Vec<StepRecord>,
    /// Output payload of each completed stage.
    pub outputs: BTreeMap<String, Payload>,
    pub state: StateSnapshot,
    pub trace: Option<Value>,
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Book-keeping for one run; never shared.
struct RunContext {
    record: RunRecord,
    tracer: Tracer,
    sequence: u32,
    steps: Vec<StepRecord>,
    executed: Vec<String>,
    outputs: BTreeMap<String, Payload>,
}

impl RunContext {
    fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    fn next_sequence(&mut self) -> u32 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }
}

/// Drives the handoff chain for one run at a time.
///
/// A runner holds only read-only configuration and shared handles, so one
/// instance can serve many concurrent runs.
pub struct Runner {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn RunStore>,
    max_steps: usize,
    max_retries: u32,
    overrides: HashMap<String, String>,
    on_stage_failure: StageFailurePolicy,
    on_persistence_failure: PersistencePolicy,
    export_trace: bool,
    max_workers: usize,
    preflight: Vec<PreflightCheck>,
    on_step: Option<StepHook>,
    on_error: Option<ErrorHook>,
}

impl Runner {
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<dyn RunStore>) -> Self {
        Self {
            registry,
            store,
            max_steps: 64,
            max_retries: 0,
            overrides: HashMap::new(),
            on_stage_failure: StageFailurePolicy::Propagate,
            on_persistence_failure: PersistencePolicy::Warn,
            export_trace: true,
            max_workers: 4,
            preflight: Vec::new(),
            on_step: None,
            on_error: None,
        }
    }

    /// A runner with limits and policies taken from `config`.
    pub fn from_config(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn RunStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(registry, store)
            .with_max_steps(config.max_steps)
            .with_max_retries(config.max_retries)
            .with_stage_failure_policy(config.on_stage_failure)
            .with_persistence_policy(config.on_persistence_failure)
            .with_trace_export(config.observability.tracing_enabled)
            .with_max_workers(config.parallel.max_workers)
    }

    /// Prevent accidental infinite loops.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Extra attempts for stages that fail with a retryable error.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Force `from` to hand off to `to`, ignoring its static target.
    pub fn with_override(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.overrides.insert(from.into(), to.into());
        self
    }

    pub fn with_stage_failure_policy(mut self, policy: StageFailurePolicy) -> Self {
        self.on_stage_failure = policy;
        self
    }

    pub fn with_persistence_policy(mut self, policy: PersistencePolicy) -> Self {
        self.on_persistence_failure = policy;
        self
    }

    pub fn with_trace_export(mut self, enabled: bool) -> Self {
        self.export_trace = enabled;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Register an independent check that runs before the first stage.
    ///
    /// Checks run concurrently on the worker pool and only read the state.
    pub fn with_preflight(
        mut self,
        check: impl Fn(&RunState) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.preflight.push(Box::new(check));
        self
    }

    /// Register a callback that fires after each successful stage.
    pub fn on_step(mut self, cb: impl Fn(&StepEvent<'_>) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Box::new(cb));
        self
    }

    /// Register a callback that fires when a stage fails or the run aborts.
    pub fn on_error(mut self, cb: impl Fn(&ErrorEvent<'_>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    /// Set both hooks to log stage transitions and errors through `tracing`.
    pub fn with_tracing(self) -> Self {
        self.on_step(|e| {
            tracing::info!(
                run_id = %e.run_id,
                step = e.step_number,
                agent = e.agent,
                next = ?e.result.handoff_target,
                retries = e.retries,
                secs = e.duration.as_secs_f64(),
                "stage finished"
            );
        })
        .on_error(|e| {
            tracing::error!(
                run_id = %e.run_id,
                step = e.step_number,
                agent = e.agent,
                error = %e.error,
                "stage failed"
            );
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Run the handoff chain from `start` until a stage has no successor.
    pub fn run(&self, start: &str, state: &mut RunState) -> Result<PipelineResult, PipelineError> {
        std::fs::create_dir_all(state.output_dir()).map_err(|source| PipelineError::OutputDir {
            path: state.output_dir().to_path_buf(),
            source,
        })?;

        let mut run = RunContext {
            record: RunRecord::started(Uuid::new_v4(), state.spec_path(), state.output_dir()),
            tracer: Tracer::new(),
            sequence: 0,
            steps: Vec::new(),
            executed: Vec::new(),
            outputs: BTreeMap::new(),
        };
        tracing::info!(run_id = %run.run_id(), start, "pipeline started");
        self.persist("run record", self.store.upsert_run(&run.record))?;

        if !self.preflight.is_empty() {
            let shared: &RunState = state;
            let checks: Vec<_> = self
                .preflight
                .iter()
                .map(|check| move || check(shared))
                .collect();
            if let Err(err) = run_in_parallel(checks, self.max_workers) {
                return Err(self.abort(&mut run, state, start, 0, PipelineError::Preflight(err)));
            }
        }

        let mut current = Some(start.to_string());
        let mut step_number = 0;

        while let Some(name) = current.take() {
            if step_number == self.max_steps {
                let err = PipelineError::MaxStepsExceeded {
                    limit: self.max_steps,
                    agent: name.clone(),
                };
                return Err(self.abort(&mut run, state, &name, step_number, err));
            }
            step_number += 1;

            let Some(agent) = self.registry.get(&name) else {
                let err = PipelineError::AgentNotRegistered(name.clone());
                return Err(self.abort(&mut run, state, &name, step_number, err));
            };

            let stage_span = tracing::info_span!("stage", run_id = %run.run_id(), agent = %name);
            let outcome = {
                let _entered = stage_span.enter();
                self.execute_stage(&mut run, agent, state, step_number)
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.abort(&mut run, state, &name, step_number, err)),
            };

            match outcome {
                Ok(result) => {
                    current = determine_next_agent(&result, Some(&self.overrides));
                    run.executed.push(name);
                    run.outputs.insert(result.agent_name, result.output);
                }
                Err(err) => {
                    tracing::error!(run_id = %run.run_id(), agent = %name, error = %err, "stage failed");
                    self.fire_error(run.run_id(), &name, &err, step_number);
                    let result = self.finish(run, state, RunStatus::Failed, Some(err.to_string()))?;
                    return match self.on_stage_failure {
                        StageFailurePolicy::Propagate => Err(PipelineError::StageFailed {
                            agent: name,
                            source: err,
                            result: Box::new(result),
                        }),
                        StageFailurePolicy::Report => Ok(result),
                    };
                }
            }
        }

        self.finish(run, state, RunStatus::Completed, None)
    }

    /// Run one stage, retrying retryable failures.
    ///
    /// The outer `Err` is a fatal persistence failure; the inner result is the
    /// stage's own outcome.
    fn execute_stage(
        &self,
        run: &mut RunContext,
        agent: &Agent,
        state: &mut RunState,
        step_number: usize,
    ) -> Result<Result<AgentRunResult, AgentExecutionError>, PipelineError> {
        let name = agent.name();
        let mut retries = 0;

        loop {
            let input = Value::Object(state.input_payload());
            let running = StepRecord::running(run.run_id(), run.next_sequence(), name, input, retries);
            self.persist_step(run, running.clone())?;

            let started = Instant::now();
            let outcome = {
                let _span = run.tracer.span(
                    format!("agent.{name}"),
                    [("reasoning", agent.model().reasoning_effort.as_str())],
                );
                state.record_history(format!("Start {name}"));
                let outcome = agent.run(state);
                match &outcome {
                    Ok(_) => state.record_history(format!("End {name}")),
                    Err(_) => state.record_history(format!("Failed {name}")),
                }
                outcome
            };
            let duration = started.elapsed();

            let recorded = match &outcome {
                Ok(result) => Ok(json!({
                    "output": result.output,
                    "events": result.events,
                    "warnings": result.warnings,
                    "artifacts": result.artifacts,
                })),
                Err(err) => Err(err.to_string()),
            };
            let closing = running.finish(
                run.next_sequence(),
                recorded,
                duration.as_secs_f64() * 1000.0,
            );
            self.persist_step(run, closing)?;
            self.record_artifacts(run.run_id(), state)?;

            match outcome {
                Ok(result) => {
                    tracing::info!(
                        duration_ms = duration.as_millis() as u64,
                        retries,
                        "stage completed"
                    );
                    if let Some(cb) = &self.on_step {
                        cb(&StepEvent {
                            run_id: run.run_id(),
                            agent: name,
                            result: &result,
                            duration,
                            step_number,
                            retries,
                        });
                    }
                    return Ok(Ok(result));
                }
                Err(err) if err.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    tracing::warn!(error = %err, attempt = retries + 1, "retrying stage");
                }
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    /// Mark the run failed for an error that is never subject to policy.
    fn abort(
        &self,
        run: &mut RunContext,
        state: &RunState,
        agent: &str,
        step_number: usize,
        err: PipelineError,
    ) -> PipelineError {
        tracing::error!(run_id = %run.run_id(), agent, error = %err, "pipeline aborted");
        self.fire_error(run.run_id(), agent, &err, step_number);

        run.record.status = RunStatus::Failed;
        run.record.finished_at = Some(Utc::now());
        run.record.metadata = json!({
            "agents_executed": run.executed,
            "error": err.to_string(),
            "history": state.history(),
        });
        // The abort reason wins over a failure to record it.
        if let Err(store_err) = self.store.upsert_run(&run.record) {
            tracing::warn!(error = %store_err, "could not mark aborted run as failed");
        }
        err
    }

    fn finish(
        &self,
        mut run: RunContext,
        state: &RunState,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<PipelineResult, PipelineError> {
        run.record.status = status;
        run.record.finished_at = Some(Utc::now());
        run.record.metadata = json!({
            "agents_executed": run.executed,
            "error": error,
            "history": state.history(),
        });
        self.persist("run record", self.store.upsert_run(&run.record))?;

        let duration_ms = run.tracer.total_duration_ms();
        tracing::info!(
            run_id = %run.run_id(),
            %status,
            stages = run.executed.len(),
            duration_ms,
            "pipeline finished"
        );

        Ok(PipelineResult {
            run_id: run.run_id(),
            status,
            agents_executed: run.executed,
            duration_ms,
            trace: self.export_trace.then(|| run.tracer.to_json()),
            steps: run.steps,
            outputs: run.outputs,
            state: state.snapshot(),
            error,
        })
    }

    fn persist_step(&self, run: &mut RunContext, step: StepRecord) -> Result<(), PipelineError> {
        let written = self.store.append_steps(std::slice::from_ref(&step));
        run.steps.push(step);
        self.persist("step record", written)
    }

    fn record_artifacts(&self, run_id: Uuid, state: &RunState) -> Result<(), PipelineError> {
        let now = Utc::now();
        let records: Vec<ArtifactRecord> = state
            .artifact_paths()
            .into_iter()
            .map(|(kind, path)| ArtifactRecord {
                run_id,
                kind,
                path,
                recorded_at: now,
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        self.persist("artifact records", self.store.record_artifacts(&records))
    }

    /// Apply the persistence policy to a store write.
    fn persist(&self, what: &str, written: Result<(), StoreError>) -> Result<(), PipelineError> {
        match written {
            Ok(()) => Ok(()),
            Err(err) => match self.on_persistence_failure {
                PersistencePolicy::Warn => {
                    tracing::warn!(error = %err, what, "persistence failed, continuing");
                    Ok(())
                }
                PersistencePolicy::Fatal => Err(PipelineError::Persistence(err)),
            },
        }
    }

    fn fire_error(
        &self,
        run_id: Uuid,
        agent: &str,
        error: &(dyn std::error::Error + 'static),
        step_number: usize,
    ) {
        if let Some(cb) = &self.on_error {
            cb(&ErrorEvent {
                run_id,
                agent,
                error,
                step_number,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::payload;
    use crate::guardrail::{Verdict, guardrail};
    use crate::store::{MemoryRunStore, StepStatus};
    use crate::tools::{Tool, ToolError, ToolRegistry};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(name: &str, next: Option<&str>) -> Agent {
        let builder = Agent::builder(name).behavior_fn(|_, _| Ok(Payload::new()));
        let builder = match next {
            Some(target) => builder.handoff(target),
            None => builder,
        };
        builder.build(&ToolRegistry::new()).unwrap()
    }

    fn registry(agents: Vec<Agent>) -> Arc<AgentRegistry> {
        let builder = agents
            .into_iter()
            .fold(AgentRegistry::builder(), |b, a| b.register(a));
        Arc::new(builder.build().unwrap())
    }

    fn state() -> (tempfile::TempDir, RunState) {
        let dir = tempfile::tempdir().unwrap();
        let st = RunState::new(dir.path().join("spec.json"), dir.path().join("out"))
            .with_spec(json!({"requirements": ["a", "b"]}));
        (dir, st)
    }

    fn count(steps: &[StepRecord], status: StepStatus) -> usize {
        steps.iter().filter(|s| s.status == status).count()
    }

    struct Counting(Arc<AtomicUsize>);

    impl Tool for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn execute(&self, _: &Payload) -> Result<Payload, ToolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::new())
        }
    }

    /// Fails the first `fail_times` calls.
    struct Flaky {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
    }

    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn execute(&self, _: &Payload) -> Result<Payload, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(ToolError::other("connection reset"))
            } else {
                Ok(payload(json!({"status": "ok"})))
            }
        }
    }

    #[test]
    fn chain_visits_every_agent_once_in_handoff_order() {
        let reg = registry(vec![
            noop("A", Some("B")),
            noop("B", Some("C")),
            noop("C", None),
        ]);
        let store = Arc::new(MemoryRunStore::new());
        let runner = Runner::new(reg, store.clone());

        let (_dir, mut st) = state();
        let result = runner.run("A", &mut st).unwrap();

        assert_eq!(result.agents_executed, vec!["A", "B", "C"]);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps.len(), 6);
        assert_eq!(
            count(&result.steps, StepStatus::Running),
            count(&result.steps, StepStatus::Completed) + count(&result.steps, StepStatus::Failed)
        );
        assert_eq!(store.steps(result.run_id).unwrap(), result.steps);
        assert_eq!(
            store.run(result.run_id).unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(
            result.state.history,
            vec!["Start A", "End A", "Start B", "End B", "Start C", "End C"]
        );
    }

    #[test]
    fn override_redirects_handoff() {
        let reg = registry(vec![
            noop("A", Some("B")),
            noop("B", None),
            noop("C", None),
        ]);
        let runner = Runner::new(reg, Arc::new(MemoryRunStore::new())).with_override("A", "C");

        let (_dir, mut st) = state();
        let result = runner.run("A", &mut st).unwrap();
        assert_eq!(result.agents_executed, vec!["A", "C"]);
    }

    #[test]
    fn unregistered_agent_is_fatal_and_marks_run_failed() {
        let store = Arc::new(MemoryRunStore::new());
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let runner = Runner::new(registry(vec![noop("A", None)]), store.clone())
            .with_override("A", "Ghost")
            .on_error(move |e| {
                *seen_clone.lock().unwrap() = Some(e.run_id);
            });

        let (_dir, mut st) = state();
        let err = runner.run("A", &mut st).unwrap_err();
        assert!(matches!(err, PipelineError::AgentNotRegistered(ref n) if n == "Ghost"));

        let run_id = seen.lock().unwrap().unwrap();
        assert_eq!(store.run(run_id).unwrap().unwrap().status, RunStatus::Failed);
        // A ran before the bad handoff was discovered.
        assert_eq!(store.steps(run_id).unwrap().len(), 2);
    }

    #[test]
    fn unregistered_agent_ignores_report_policy() {
        let runner = Runner::new(registry(vec![noop("A", None)]), Arc::new(MemoryRunStore::new()))
            .with_stage_failure_policy(StageFailurePolicy::Report);
        let (_dir, mut st) = state();
        assert!(matches!(
            runner.run("Missing", &mut st),
            Err(PipelineError::AgentNotRegistered(_))
        ));
    }

    #[test]
    fn handoff_cycle_hits_max_steps() {
        let reg = registry(vec![noop("A", Some("B")), noop("B", Some("A"))]);
        let runner = Runner::new(reg, Arc::new(MemoryRunStore::new())).with_max_steps(5);

        let (_dir, mut st) = state();
        let err = runner.run("A", &mut st).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MaxStepsExceeded { limit: 5, ref agent } if agent == "B"
        ));
    }

    #[test]
    fn input_guardrail_failure_runs_no_tools_and_fails_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guarded = Agent::builder("Guarded")
            .tool(Counting(Arc::clone(&calls)))
            .input_guardrail(guardrail("spec_available", |_, _| {
                Verdict::fail(["spec missing", "path unreadable"])
            }))
            .behavior_fn(|_, cx| cx.call("counting", json!({})))
            .build(&ToolRegistry::new())
            .unwrap();

        let store = Arc::new(MemoryRunStore::new());
        let runner = Runner::new(registry(vec![guarded]), store.clone());
        let (_dir, mut st) = state();
        let err = runner.run("Guarded", &mut st).unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let result = err.result().unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.agents_executed.is_empty());

        let last = result.steps.last().unwrap();
        assert_eq!(last.status, StepStatus::Failed);
        let msg = last.error.as_deref().unwrap();
        assert!(msg.contains("spec missing; path unreadable"));
        assert_eq!(
            store.run(result.run_id).unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[test]
    fn rejected_output_is_not_reachable_from_result() {
        let producer = Agent::builder("Producer")
            .behavior_fn(|_, _| Ok(payload(json!({"secret": "UNVALIDATED-OUTPUT"}))))
            .output_guardrail(guardrail("never_valid", |_, _| Verdict::fail(["bad output"])))
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![producer]), Arc::new(MemoryRunStore::new()))
            .with_stage_failure_policy(StageFailurePolicy::Report);
        let (_dir, mut st) = state();
        let result = runner.run("Producer", &mut st).unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.outputs.is_empty());
        let serialized = serde_json::to_string(&result).unwrap();
        assert!(!serialized.contains("UNVALIDATED-OUTPUT"));
        assert!(result.error.as_deref().unwrap().contains("bad output"));
    }

    #[test]
    fn retryable_failures_are_retried_up_to_the_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = Agent::builder("Flaky")
            .tool(Flaky {
                calls: Arc::clone(&calls),
                fail_times: 2,
            })
            .behavior_fn(|_, cx| cx.call("flaky", json!({})))
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![flaky]), Arc::new(MemoryRunStore::new()))
            .with_max_retries(2);
        let (_dir, mut st) = state();
        let result = runner.run("Flaky", &mut st).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.steps.len(), 6);
        assert_eq!(count(&result.steps, StepStatus::Failed), 2);
        assert_eq!(result.steps.last().unwrap().retries, 2);
        assert_eq!(result.agents_executed, vec!["Flaky"]);
    }

    #[test]
    fn retries_exhausted_fails_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = Agent::builder("Flaky")
            .tool(Flaky {
                calls: Arc::clone(&calls),
                fail_times: 10,
            })
            .behavior_fn(|_, cx| cx.call("flaky", json!({})))
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![flaky]), Arc::new(MemoryRunStore::new()))
            .with_max_retries(1);
        let (_dir, mut st) = state();
        let err = runner.run("Flaky", &mut st).unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, PipelineError::StageFailed { .. }));
    }

    #[test]
    fn invalid_tool_arguments_are_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let agent = Agent::builder("A")
            .behavior_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentExecutionError::Tool {
                    agent: "A".into(),
                    tool: "file_writer".into(),
                    source: ToolError::invalid("path must stay under the output directory"),
                })
            })
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![agent]), Arc::new(MemoryRunStore::new()))
            .with_max_retries(2);
        let (_dir, mut st) = state();
        let err = runner.run("A", &mut st).unwrap_err();

        assert!(matches!(err, PipelineError::StageFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.result().unwrap().steps.len(), 2);
    }

    #[test]
    fn guardrail_failures_are_never_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let agent = Agent::builder("A")
            .behavior_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new())
            })
            .output_guardrail(guardrail("no", |_, _| Verdict::fail(["no"])))
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![agent]), Arc::new(MemoryRunStore::new()))
            .with_max_retries(3);
        let (_dir, mut st) = state();
        assert!(runner.run("A", &mut st).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn crash_mid_stage_leaves_one_unmatched_running_record() {
        let crashing = Agent::builder("B")
            .behavior_fn(|_, _| panic!("process died"))
            .build(&ToolRegistry::new())
            .unwrap();
        let store = Arc::new(MemoryRunStore::new());
        let run_id = Arc::new(Mutex::new(None));
        let run_id_clone = Arc::clone(&run_id);

        let runner = Runner::new(registry(vec![noop("A", Some("B")), crashing]), store.clone())
            .on_step(move |e| {
                *run_id_clone.lock().unwrap() = Some(e.run_id);
            });

        let (_dir, mut st) = state();
        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runner.run("A", &mut st)
        }));
        assert!(crashed.is_err());

        let run_id = run_id.lock().unwrap().unwrap();
        let steps = store.steps(run_id).unwrap();
        let running = count(&steps, StepStatus::Running);
        let finished = count(&steps, StepStatus::Completed) + count(&steps, StepStatus::Failed);
        assert_eq!(running - finished, 1);
        assert_eq!(steps.last().unwrap().agent_name, "B");
        assert_eq!(steps.last().unwrap().status, StepStatus::Running);
    }

    struct BrokenStore(MemoryRunStore);

    impl RunStore for BrokenStore {
        fn init_schema(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
            self.0.upsert_run(run)
        }
        fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
            self.0.run(run_id)
        }
        fn set_run_status(
            &self,
            run_id: Uuid,
            status: RunStatus,
            finished_at: Option<chrono::DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.0.set_run_status(run_id, status, finished_at)
        }
        fn append_steps(&self, _: &[StepRecord]) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk full".into()))
        }
        fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
            self.0.steps(run_id)
        }
        fn record_artifacts(&self, artifacts: &[ArtifactRecord]) -> Result<(), StoreError> {
            self.0.record_artifacts(artifacts)
        }
        fn artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, StoreError> {
            self.0.artifacts(run_id)
        }
    }

    #[test]
    fn persistence_failure_is_tolerated_under_warn_policy() {
        let runner = Runner::new(
            registry(vec![noop("A", Some("B")), noop("B", None)]),
            Arc::new(BrokenStore(MemoryRunStore::new())),
        );
        let (_dir, mut st) = state();
        let result = runner.run("A", &mut st).unwrap();
        assert!(result.is_completed());
        // The local record is kept even though the store refused it.
        assert_eq!(result.steps.len(), 4);
    }

    #[test]
    fn persistence_failure_aborts_under_fatal_policy() {
        let runner = Runner::new(
            registry(vec![noop("A", None)]),
            Arc::new(BrokenStore(MemoryRunStore::new())),
        )
        .with_persistence_policy(PersistencePolicy::Fatal);
        let (_dir, mut st) = state();
        let err = runner.run("A", &mut st).unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        // The running record could not be written, so the stage never started.
        assert!(st.history().is_empty());
    }

    #[test]
    fn fatal_persistence_failure_still_marks_run_failed() {
        let store = Arc::new(BrokenStore(MemoryRunStore::new()));
        let run_id = Arc::new(Mutex::new(None));
        let run_id_clone = Arc::clone(&run_id);
        let runner = Runner::new(registry(vec![noop("A", None)]), store.clone())
            .with_persistence_policy(PersistencePolicy::Fatal)
            .on_error(move |e| {
                *run_id_clone.lock().unwrap() = Some(e.run_id);
            });

        let (_dir, mut st) = state();
        assert!(runner.run("A", &mut st).is_err());
        let run_id = run_id.lock().unwrap().unwrap();
        assert_eq!(store.run(run_id).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn hooks_fire_per_stage_and_on_failure() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let steps_clone = Arc::clone(&steps);
        let errors_clone = Arc::clone(&errors);

        let failing = Agent::builder("C")
            .behavior_fn(|_, cx| Err(AgentExecutionError::behavior(cx.agent_name(), "nope")))
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(
            registry(vec![noop("A", Some("B")), noop("B", Some("C")), failing]),
            Arc::new(MemoryRunStore::new()),
        )
        .on_step(move |e| {
            steps_clone
                .lock()
                .unwrap()
                .push((e.agent.to_string(), e.step_number));
        })
        .on_error(move |e| {
            assert_eq!(e.agent, "C");
            assert_eq!(e.error.to_string(), "C: nope");
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (_dir, mut st) = state();
        let _ = runner.run("A", &mut st);
        assert_eq!(
            *steps.lock().unwrap(),
            vec![("A".to_string(), 1), ("B".to_string(), 2)]
        );
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preflight_failure_aborts_before_any_stage() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let agent = Agent::builder("A")
            .behavior_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new())
            })
            .build(&ToolRegistry::new())
            .unwrap();

        let runner = Runner::new(registry(vec![agent]), Arc::new(MemoryRunStore::new()))
            .with_preflight(|_| Ok(()))
            .with_preflight(|st| {
                if st.loaded_spec().is_some() {
                    Err("output directory is dirty".into())
                } else {
                    Ok(())
                }
            });

        let (_dir, mut st) = state();
        let err = runner.run("A", &mut st).unwrap_err();
        match err {
            PipelineError::Preflight(agg) => {
                assert_eq!(agg.failures.len(), 1);
                assert_eq!(agg.failures[0].index, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn trace_carries_reasoning_tags_and_can_be_disabled() {
        let agent = Agent::builder("A")
            .model(crate::agent::ModelDescriptor {
                reasoning_effort: "high".into(),
                ..Default::default()
            })
            .build(&ToolRegistry::new())
            .unwrap();
        let reg = registry(vec![agent]);

        let (_dir, mut st) = state();
        let runner = Runner::new(Arc::clone(&reg), Arc::new(MemoryRunStore::new()));
        let result = runner.run("A", &mut st).unwrap();
        let trace = result.trace.unwrap();
        assert_eq!(trace["spans"][0]["name"], "agent.A");
        assert_eq!(trace["spans"][0]["reasoning"], "high");

        let (_dir, mut st) = state();
        let quiet = Runner::new(reg, Arc::new(MemoryRunStore::new())).with_trace_export(false);
        assert!(quiet.run("A", &mut st).unwrap().trace.is_none());
    }

    #[test]
    fn artifacts_written_by_stages_are_recorded() {
        let writer = Agent::builder("Writer")
            .behavior_fn(|state, _| {
                state
                    .project_files
                    .insert("src/main.py".into(), "print()".into());
                Ok(Payload::new())
            })
            .build(&ToolRegistry::new())
            .unwrap();

        let store = Arc::new(MemoryRunStore::new());
        let runner = Runner::new(registry(vec![writer]), store.clone());
        let (_dir, mut st) = state();
        let result = runner.run("Writer", &mut st).unwrap();

        let artifacts = store.artifacts(result.run_id).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, st.output_dir().join("src/main.py"));
        assert_eq!(result.state.project_files.len(), 1);
    }
}
