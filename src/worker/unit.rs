//! Execution unit — loads a graph once, then runs one task at a time.
//!
//! A unit announces itself ready once its graph has loaded. Protocol per task:
//! - run the graph on its own thread under a hard wall-clock timeout
//! - report a structured [`JobResult`] for success, graph errors and panics
//!   and keep serving
//! - on timeout, report the failure and exit; the pool replaces the unit

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::graph::{Graph, GraphLoader, GraphState};
use crate::jobs::{ExecutionMetadata, JobResult, Message};

/// Error text recorded when a task exceeds the execution timeout.
pub const TIMEOUT_ERROR: &str = "execution timeout";

/// A job handed to a unit.
#[derive(Debug, Clone)]
pub struct UnitTask {
    pub job_id: Uuid,
    pub messages: Vec<Message>,
}

/// Message from a unit to the pool.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    /// The graph loaded; the unit accepts tasks from now on.
    Ready { worker_id: u64 },
    Report(UnitReport),
}

/// Outcome of one task, sent back to the pool.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub worker_id: u64,
    pub job_id: Uuid,
    pub result: JobResult,
    /// The unit exits right after this report.
    pub exiting: bool,
}

/// Why a unit stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Task channel closed; normal shutdown.
    Stopped,
    /// The graph could not be loaded.
    LoadFailed,
    /// A task hit the execution timeout.
    TimedOut { job_id: Uuid },
}

impl std::fmt::Display for UnitExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::LoadFailed => write!(f, "graph failed to load"),
            Self::TimedOut { .. } => write!(f, "{TIMEOUT_ERROR}"),
        }
    }
}

/// Everything a unit needs to start.
#[derive(Clone)]
pub struct UnitSpec {
    pub worker_id: u64,
    pub location: PathBuf,
    pub loader: Arc<GraphLoader>,
    pub execution_timeout: Duration,
}

/// Run a unit until its task channel closes, its graph fails to load, or a
/// task times out.
pub async fn run_unit(
    spec: UnitSpec,
    mut tasks: mpsc::Receiver<UnitTask>,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> UnitExit {
    let worker_id = spec.worker_id;

    let graph = match spec.loader.load(&spec.location).await {
        Ok(graph) => graph,
        Err(e) => {
            // GraphError display never includes the location
            tracing::error!(worker_id, error = %e, "Worker failed to load graph, exiting");
            return UnitExit::LoadFailed;
        }
    };
    tracing::debug!(worker_id, "Worker ready");
    if events.send(UnitEvent::Ready { worker_id }).is_err() {
        return UnitExit::Stopped;
    }

    while let Some(task) = tasks.recv().await {
        let job_id = task.job_id;
        tracing::debug!(worker_id, job_id = %job_id, "Worker executing job");

        let outcome = execute(Arc::clone(&graph), task.messages, spec.execution_timeout).await;
        let exiting = matches!(outcome, Outcome::TimedOut(_));
        let result = match outcome {
            Outcome::Finished(result) | Outcome::TimedOut(result) => result,
        };

        if events
            .send(UnitEvent::Report(UnitReport {
                worker_id,
                job_id,
                result,
                exiting,
            }))
            .is_err()
        {
            tracing::warn!(worker_id, job_id = %job_id, "Pool gone, dropping result");
            return UnitExit::Stopped;
        }

        if exiting {
            // The timed-out computation cannot be trusted to stop; retire the unit.
            tracing::warn!(worker_id, job_id = %job_id, "Worker timed out, exiting");
            return UnitExit::TimedOut { job_id };
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
    UnitExit::Stopped
}

enum Outcome {
    Finished(JobResult),
    TimedOut(JobResult),
}

/// Run the graph once and translate every ending into a `JobResult`.
///
/// The graph runs on a blocking thread so a computation that never yields
/// cannot hold off the deadline. The deadline is authoritative: a result
/// that arrives after it is discarded and reported as a timeout.
async fn execute(graph: Arc<dyn Graph>, messages: Vec<Message>, timeout: Duration) -> Outcome {
    let started_at = Utc::now();
    let deadline = Instant::now() + timeout;
    let state = GraphState::from_messages(messages);
    let runtime = Handle::current();
    let run = tokio::task::spawn_blocking(move || runtime.block_on(graph.execute(state)));

    let joined = tokio::time::timeout_at(deadline, run).await;
    let metadata = ExecutionMetadata::between(started_at, Utc::now());

    let joined = match joined {
        Ok(joined) if Instant::now() < deadline => joined,
        // Nothing can stop the computation; its thread is left to finish alone
        _ => return Outcome::TimedOut(JobResult::failure(TIMEOUT_ERROR, metadata)),
    };

    match joined {
        Err(e) if e.is_panic() => Outcome::Finished(JobResult::failure(
            format!("graph panicked: {}", panic_message(e.into_panic().as_ref())),
            metadata,
        )),
        Err(e) => Outcome::Finished(JobResult::failure(format!("graph task failed: {e}"), metadata)),
        Ok(Err(e)) => Outcome::Finished(JobResult::failure(e.to_string(), metadata)),
        Ok(Ok(output)) => {
            let content = output.state.last_content().map(str::to_string);
            let result = if output.status.is_finished() {
                JobResult::success(content, metadata)
            } else {
                JobResult {
                    content,
                    success: false,
                    error: Some(format!("graph ended with status {}", output.status)),
                    metadata,
                }
            };
            Outcome::Finished(result)
        }
    }
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
