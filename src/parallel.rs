//! Bounded fan-out for work that does not touch a run's state.
//!
//! Every task is joined before these functions return. A failing or
//! panicking task never cancels its siblings; failures are collected and
//! surfaced together.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread;

use thiserror::Error;

use crate::error::PipelineError;
use crate::runner::{PipelineResult, Runner};
use crate::state::RunState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Position of the task in the submitted list.
    pub index: usize,
    pub message: String,
}

/// Aggregate of every task that failed in one fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {total} task(s) failed{}", .failures.len(), describe(.failures))]
pub struct ParallelError {
    pub total: usize,
    pub failures: Vec<TaskFailure>,
}

fn describe(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("; #{}: {}", f.index, f.message))
        .collect()
}

/// Run fallible tasks on at most `max_workers` threads.
///
/// Results come back in submission order. Any error or panic turns the whole
/// call into a [`ParallelError`] listing every failure.
pub fn run_in_parallel<T, E, F>(tasks: Vec<F>, max_workers: usize) -> Result<Vec<T>, ParallelError>
where
    F: FnOnce() -> Result<T, E> + Send,
    T: Send,
    E: fmt::Display,
{
    let total = tasks.len();
    let wrapped: Vec<_> = tasks
        .into_iter()
        .map(|task| move || task().map_err(|e| e.to_string()))
        .collect();

    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (index, outcome) in execute_bounded(wrapped, max_workers).into_iter().enumerate() {
        match outcome {
            Ok(Ok(value)) => values.push(value),
            Ok(Err(message)) => failures.push(TaskFailure { index, message }),
            Err(panic) => failures.push(TaskFailure {
                index,
                message: format!("panicked: {panic}"),
            }),
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        Err(ParallelError { total, failures })
    }
}

/// Execute independent pipeline runs concurrently.
///
/// Each state gets its own run id and tracer; the runner's registry and
/// store are shared. One result per state, in input order.
pub fn run_pipelines(
    runner: &Runner,
    start: &str,
    states: Vec<RunState>,
    max_workers: usize,
) -> Vec<Result<PipelineResult, PipelineError>> {
    let tasks: Vec<_> = states
        .into_iter()
        .map(|mut state| move || runner.run(start, &mut state))
        .collect();

    execute_bounded(tasks, max_workers)
        .into_iter()
        .map(|outcome| outcome.unwrap_or_else(|panic| Err(PipelineError::WorkerPanicked(panic))))
        .collect()
}

/// Worker pool core. `Err` carries a panic message.
fn execute_bounded<T, F>(tasks: Vec<F>, max_workers: usize) -> Vec<Result<T, String>>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = max_workers.clamp(1, total);

    let queue: Mutex<VecDeque<(usize, F)>> = Mutex::new(tasks.into_iter().enumerate().collect());
    let slots: Mutex<Vec<Option<Result<T, String>>>> =
        Mutex::new((0..total).map(|_| None).collect());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some((index, task)) = next else {
                        break;
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                        .map_err(|payload| panic_message(payload.as_ref()));
                    slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(outcome);
                }
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err("task never ran".to_string())))
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
