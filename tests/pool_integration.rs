//! Integration tests for the job manager + worker pool.
//!
//! Each test starts a real pool whose units load a manifest from a temp
//! directory and run a scripted stub graph.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use convo_queue::config::{GraphConfig, JobManagerConfig, PoolConfig};
use convo_queue::error::{GraphError, JobError};
use convo_queue::graph::{Graph, GraphOutput, GraphRegistry, GraphState, GraphStatus};
use convo_queue::jobs::{Job, JobEvent, JobManager, JobStatus, Message};
use convo_queue::worker::WorkerPool;

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub graph driven by the last message:
/// - `hang` sleeps far longer than any test timeout
/// - `slow` sleeps 150ms
/// - `block` blocks its thread for 800ms without yielding
/// - anything else is echoed back
struct ScriptGraph;

#[async_trait]
impl Graph for ScriptGraph {
    async fn execute(&self, mut state: GraphState) -> Result<GraphOutput, GraphError> {
        let last = state.last_content().unwrap_or_default().to_string();
        match last.as_str() {
            "hang" => tokio::time::sleep(Duration::from_secs(3600)).await,
            "slow" => tokio::time::sleep(Duration::from_millis(150)).await,
            "block" => std::thread::sleep(Duration::from_millis(800)),
            _ => {}
        }
        state.messages.push(Message::assistant(format!("echo: {last}")));
        Ok(GraphOutput {
            state,
            status: GraphStatus::Completed,
        })
    }
}

struct Harness {
    _dir: TempDir,
    jobs: Arc<JobManager>,
    pool: WorkerPool,
}

fn pool_config(dir: &TempDir, max_workers: usize) -> PoolConfig {
    PoolConfig {
        max_workers,
        execution_timeout: Duration::from_secs(5),
        termination_timeout: Duration::from_secs(1),
        dispatch_retry_delay: Duration::from_millis(20),
        respawn_delay: Duration::from_millis(20),
        graph: GraphConfig {
            base_dir: dir.path().to_path_buf(),
            path: PathBuf::from("script.json"),
            allowed_extensions: vec!["json".to_string()],
        },
    }
}

fn start(
    jobs_config: JobManagerConfig,
    configure: impl FnOnce(&TempDir) -> PoolConfig,
) -> Harness {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("script.json"), r#"{"kind":"script"}"#).unwrap();

    let registry = GraphRegistry::with_builtins();
    registry.register(
        "script",
        Arc::new(|_: &serde_json::Value| -> Result<Arc<dyn Graph>, GraphError> {
            Ok(Arc::new(ScriptGraph))
        }),
    );

    let jobs = JobManager::new(jobs_config);
    let pool = WorkerPool::start(configure(&dir), Arc::clone(&jobs), Arc::new(registry)).unwrap();
    Harness {
        _dir: dir,
        jobs,
        pool,
    }
}

fn jobs_config(max_queue_size: usize) -> JobManagerConfig {
    JobManagerConfig {
        max_queue_size,
        ..JobManagerConfig::default()
    }
}

async fn submit(jobs: &JobManager, content: &str) -> Job {
    jobs.submit(vec![Message::user(content)], serde_json::Value::Null)
        .await
        .unwrap()
}

/// Poll until the job satisfies `done`, failing the test on timeout.
async fn wait_for(jobs: &JobManager, id: Uuid, done: impl Fn(&Job) -> bool) -> Job {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(job) = jobs.get_job(id).await
                && done(&job)
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for job")
}

async fn wait_finished(jobs: &JobManager, id: Uuid) -> Job {
    wait_for(jobs, id, |job| job.status.is_terminal()).await
}

#[tokio::test]
async fn completes_a_job() {
    let h = start(jobs_config(10), |dir| pool_config(dir, 2));

    let job = submit(&h.jobs, "hello").await;
    let done = wait_finished(&h.jobs, job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("echo: hello"));

    let started = done.started_at.unwrap();
    let completed = done.completed_at.unwrap();
    assert!(started >= done.created_at);
    assert!(completed >= started);

    h.pool.terminate().await;
}

#[tokio::test]
async fn single_worker_runs_jobs_in_arrival_order() {
    let h = start(jobs_config(10), |dir| pool_config(dir, 1));

    let first = submit(&h.jobs, "slow").await;
    let second = submit(&h.jobs, "slow").await;
    let third = submit(&h.jobs, "slow").await;

    wait_for(&h.jobs, first.id, |job| job.status == JobStatus::Running).await;
    assert_eq!(h.jobs.queue_position(first.id).await, None);
    assert_eq!(h.jobs.queue_position(second.id).await, Some(0));
    assert_eq!(h.jobs.queue_position(third.id).await, Some(1));

    let first = wait_finished(&h.jobs, first.id).await;
    let second = wait_finished(&h.jobs, second.id).await;
    let third = wait_finished(&h.jobs, third.id).await;

    assert!(first.started_at.unwrap() < second.started_at.unwrap());
    assert!(second.started_at.unwrap() < third.started_at.unwrap());
    // One worker: each job starts after the previous one finished
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
    assert!(third.started_at.unwrap() >= second.completed_at.unwrap());

    h.pool.terminate().await;
}

#[tokio::test]
async fn submission_positions_behind_a_running_job() {
    let h = start(jobs_config(10), |dir| pool_config(dir, 1));

    let first = submit(&h.jobs, "hang").await;
    wait_for(&h.jobs, first.id, |job| job.status == JobStatus::Running).await;

    let second = submit(&h.jobs, "two").await;
    assert_eq!(h.jobs.queue_position(second.id).await, Some(0));
    let third = submit(&h.jobs, "three").await;
    assert_eq!(h.jobs.queue_position(second.id).await, Some(0));
    assert_eq!(h.jobs.queue_position(third.id).await, Some(1));
    // Not queued any more
    assert_eq!(h.jobs.queue_position(first.id).await, None);

    h.pool.terminate().await;
}

#[tokio::test]
async fn every_job_is_started_exactly_once() {
    let h = start(jobs_config(50), |dir| pool_config(dir, 3));
    let mut events = h.jobs.subscribe();

    let mut ids = Vec::new();
    for i in 0..12 {
        let content = if i % 3 == 0 { "slow" } else { "fast" };
        ids.push(submit(&h.jobs, content).await.id);
    }
    for id in &ids {
        let job = wait_finished(&h.jobs, *id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    let mut starts: HashMap<Uuid, usize> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Started { id } = event {
            *starts.entry(id).or_default() += 1;
        }
    }
    for id in &ids {
        assert_eq!(starts.get(id), Some(&1), "job {id} started {:?} times", starts.get(id));
    }

    let stats = h.pool.stats().await;
    assert_eq!(stats.jobs.completed, 12);
    assert_eq!(stats.workers, 3);
    assert_eq!(stats.busy_workers, 0);

    h.pool.terminate().await;
}

#[tokio::test]
async fn queue_full_rejects_until_capacity_frees() {
    let h = start(jobs_config(2), |dir| pool_config(dir, 1));

    let running = submit(&h.jobs, "hang").await;
    wait_for(&h.jobs, running.id, |job| job.status == JobStatus::Running).await;
    submit(&h.jobs, "hello").await;

    let err = h
        .jobs
        .submit(vec![Message::user("one too many")], serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::QueueFull { max: 2 }));

    h.pool.terminate().await;
}

#[tokio::test]
async fn timeout_fails_job_and_respawns_worker() {
    let h = start(jobs_config(10), |dir| PoolConfig {
        execution_timeout: Duration::from_millis(100),
        ..pool_config(dir, 1)
    });

    let stuck = submit(&h.jobs, "hang").await;
    let failed = wait_finished(&h.jobs, stuck.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("timeout"));

    // The replacement worker picks up new work
    let next = submit(&h.jobs, "after").await;
    let done = wait_finished(&h.jobs, next.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result.unwrap().content.as_deref(), Some("echo: after"));

    let stats = h.pool.stats().await;
    assert_eq!(stats.workers, 1);

    h.pool.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_graph_is_failed_at_the_deadline() {
    let h = start(jobs_config(10), |dir| PoolConfig {
        execution_timeout: Duration::from_millis(100),
        ..pool_config(dir, 1)
    });

    let stuck = submit(&h.jobs, "block").await;
    let failed = wait_finished(&h.jobs, stuck.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("timeout"));

    // Recorded at the deadline, not when the computation finally returned
    let result = failed.result.unwrap();
    assert!(!result.success);
    assert!(result.metadata.elapsed_ms < 700, "elapsed {}ms", result.metadata.elapsed_ms);

    // Its late result never overwrites the failure
    tokio::time::sleep(Duration::from_millis(900)).await;
    let job = h.jobs.get_job(stuck.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    h.pool.terminate().await;
}

#[tokio::test]
async fn jobs_queued_behind_a_timeout_still_run() {
    let h = start(jobs_config(10), |dir| PoolConfig {
        execution_timeout: Duration::from_millis(100),
        ..pool_config(dir, 1)
    });

    let stuck = submit(&h.jobs, "hang").await;
    let waiting = submit(&h.jobs, "patient").await;

    let stuck = wait_finished(&h.jobs, stuck.id).await;
    let waiting = wait_finished(&h.jobs, waiting.id).await;
    assert_eq!(stuck.status, JobStatus::Failed);
    assert_eq!(waiting.status, JobStatus::Completed);

    h.pool.terminate().await;
}

#[tokio::test]
async fn completed_jobs_expire_after_ttl() {
    let h = start(
        JobManagerConfig {
            max_queue_size: 10,
            job_ttl: Duration::from_millis(100),
            cleanup_interval: Duration::from_millis(50),
        },
        |dir| pool_config(dir, 1),
    );

    let job = submit(&h.jobs, "hello").await;
    wait_finished(&h.jobs, job.id).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.jobs.get_job(job.id).await.is_none());

    h.pool.terminate().await;
}

#[tokio::test]
async fn shutdown_is_bounded_by_termination_timeout() {
    let h = start(jobs_config(10), |dir| PoolConfig {
        execution_timeout: Duration::from_secs(60),
        termination_timeout: Duration::from_millis(200),
        ..pool_config(dir, 2)
    });

    let stuck = submit(&h.jobs, "hang").await;
    wait_for(&h.jobs, stuck.id, |job| job.status == JobStatus::Running).await;

    let started = Instant::now();
    let report = h.pool.terminate().await;
    assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
    assert_eq!(report.exited, 1);
    assert_eq!(report.abandoned, 1);

    let stuck = h.jobs.get_job(stuck.id).await.unwrap();
    assert_eq!(stuck.status, JobStatus::Failed);
    assert!(stuck.error.unwrap().contains("shutdown"));

    // A second terminate is a no-op
    let again = h.pool.terminate().await;
    assert_eq!(again.exited + again.abandoned, 0);
}

#[tokio::test]
async fn unloadable_graph_leaves_jobs_queued() {
    let h = start(jobs_config(10), |dir| PoolConfig {
        graph: GraphConfig {
            path: PathBuf::from("../outside.json"),
            ..pool_config(dir, 1).graph
        },
        respawn_delay: Duration::from_millis(500),
        ..pool_config(dir, 1)
    });

    // Let the first unit fail to load and be marked down
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = submit(&h.jobs, "hello").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = h.jobs.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    let stats = h.pool.stats().await;
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.available_workers, 0);

    h.pool.terminate().await;
}
