//! Worker pool — owns the execution units and dispatches queued jobs to them.
//!
//! All slot bookkeeping happens on one control task. It reacts to:
//! - availability notifications from the [`JobManager`]
//! - events from units (ready, results)
//! - unit exits (crash, timeout, load failure), which trigger a respawn
//! - timers it scheduled itself (dispatch retry, respawn) and shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::graph::{GraphLoader, GraphRegistry};
use crate::jobs::{ExecutionMetadata, JobManager, JobResult, JobStats};
use crate::worker::unit::{UnitEvent, UnitExit, UnitReport, UnitSpec, UnitTask, run_unit};

/// Combined job and worker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    #[serde(flatten)]
    pub jobs: JobStats,
    pub workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
}

/// What `terminate()` observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Units that exited before the deadline.
    pub exited: usize,
    /// Units still running at the deadline and aborted.
    pub abandoned: usize,
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    jobs: Arc<JobManager>,
    commands: mpsc::UnboundedSender<PoolCommand>,
    gauges: Arc<Gauges>,
    control: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn `max_workers` units and start dispatching jobs from `jobs`.
    pub fn start(
        config: PoolConfig,
        jobs: Arc<JobManager>,
        registry: Arc<GraphRegistry>,
    ) -> Result<Self, PoolError> {
        let available = jobs
            .take_availability()
            .ok_or(PoolError::AlreadyAttached)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gauges = Arc::new(Gauges::default());
        let loader = Arc::new(GraphLoader::new(&config.graph, registry));

        let mut units = JoinSet::new();
        let mut runner = PoolRunner::new(
            config,
            Arc::clone(&jobs),
            loader,
            events_tx,
            commands_tx.clone(),
            Arc::clone(&gauges),
        );
        for _ in 0..runner.config.max_workers {
            runner.add_slot(&mut units);
        }
        runner.publish();
        info!(workers = runner.slots.len(), "Worker pool started");

        let control = tokio::spawn(runner.run(units, available, events_rx, commands_rx));

        Ok(Self {
            jobs,
            commands: commands_tx,
            gauges,
            control,
        })
    }

    /// Job counts plus worker availability.
    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            jobs: self.jobs.stats().await,
            workers: self.gauges.workers.load(Ordering::Relaxed),
            available_workers: self.gauges.idle.load(Ordering::Relaxed),
            busy_workers: self.gauges.busy.load(Ordering::Relaxed),
        }
    }

    /// Stop the TTL sweep and shut every unit down.
    ///
    /// Each unit gets `termination_timeout` to exit; stragglers are aborted.
    /// Calling this again after shutdown returns an empty report.
    pub async fn terminate(&self) -> ShutdownReport {
        self.jobs.stop_cleanup();

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Shutdown { done: done_tx })
            .is_err()
        {
            debug!("Worker pool already shut down");
            return ShutdownReport::default();
        }
        done_rx.await.unwrap_or_default()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.control.abort();
    }
}

#[derive(Debug, Default)]
struct Gauges {
    workers: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
}

enum PoolCommand {
    /// Re-announce the queue head after a busy period.
    Retry,
    /// Replace the unit in a slot.
    Respawn { slot: usize },
    Shutdown {
        done: oneshot::Sender<ShutdownReport>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Unit spawned, graph still loading.
    Starting,
    Idle,
    Busy,
    /// Unit has exited and a replacement is pending.
    Down,
}

#[derive(Debug)]
struct WorkerSlot {
    id: u64,
    tasks: Option<mpsc::Sender<UnitTask>>,
    state: SlotState,
    current_job: Option<Uuid>,
}

/// State owned by the control task.
struct PoolRunner {
    config: PoolConfig,
    jobs: Arc<JobManager>,
    loader: Arc<GraphLoader>,
    slots: Vec<WorkerSlot>,
    /// Unit task id to worker id.
    unit_workers: HashMap<tokio::task::Id, u64>,
    next_worker_id: u64,
    events: mpsc::UnboundedSender<UnitEvent>,
    commands: mpsc::UnboundedSender<PoolCommand>,
    retry_pending: bool,
    shutting_down: bool,
    gauges: Arc<Gauges>,
}

impl PoolRunner {
    fn new(
        config: PoolConfig,
        jobs: Arc<JobManager>,
        loader: Arc<GraphLoader>,
        events: mpsc::UnboundedSender<UnitEvent>,
        commands: mpsc::UnboundedSender<PoolCommand>,
        gauges: Arc<Gauges>,
    ) -> Self {
        Self {
            config,
            jobs,
            loader,
            slots: Vec::new(),
            unit_workers: HashMap::new(),
            next_worker_id: 0,
            events,
            commands,
            retry_pending: false,
            shutting_down: false,
            gauges,
        }
    }

    async fn run(
        mut self,
        mut units: JoinSet<UnitExit>,
        mut available: mpsc::UnboundedReceiver<Uuid>,
        mut events: mpsc::UnboundedReceiver<UnitEvent>,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    ) {
        loop {
            // Unit events are polled before exits so a unit's final report
            // is handled before its exit.
            tokio::select! {
                biased;

                Some(command) = commands.recv() => match command {
                    PoolCommand::Shutdown { done } => {
                        let report = self.shutdown(&mut units, &mut events).await;
                        let _ = done.send(report);
                        break;
                    }
                    PoolCommand::Retry => {
                        self.retry_pending = false;
                        self.jobs.process_queue().await;
                    }
                    PoolCommand::Respawn { slot } => self.respawn(slot, &mut units),
                },

                Some(event) = events.recv() => match event {
                    UnitEvent::Ready { worker_id } => self.on_ready(worker_id).await,
                    UnitEvent::Report(report) => self.on_report(report).await,
                },

                Some(joined) = units.join_next_with_id() => self.on_unit_exit(joined).await,

                Some(job_id) = available.recv() => self.on_available(job_id).await,

                else => break,
            }
        }
        debug!("Worker pool control loop exited");
    }

    fn next_id(&mut self) -> u64 {
        self.next_worker_id += 1;
        self.next_worker_id
    }

    fn spawn_unit(&mut self, units: &mut JoinSet<UnitExit>) -> WorkerSlot {
        let worker_id = self.next_id();
        let (tasks_tx, tasks_rx) = mpsc::channel(1);
        let spec = UnitSpec {
            worker_id,
            location: self.config.graph.path.clone(),
            loader: Arc::clone(&self.loader),
            execution_timeout: self.config.execution_timeout,
        };
        let handle = units.spawn(run_unit(spec, tasks_rx, self.events.clone()));
        self.unit_workers.insert(handle.id(), worker_id);
        debug!(worker_id, "Spawned worker");

        WorkerSlot {
            id: worker_id,
            tasks: Some(tasks_tx),
            state: SlotState::Starting,
            current_job: None,
        }
    }

    fn add_slot(&mut self, units: &mut JoinSet<UnitExit>) {
        let slot = self.spawn_unit(units);
        self.slots.push(slot);
    }

    /// Mirror slot states into the shared gauges.
    fn publish(&self) {
        let idle = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Idle)
            .count();
        let busy = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Busy)
            .count();
        self.gauges.workers.store(self.slots.len(), Ordering::Relaxed);
        self.gauges.idle.store(idle, Ordering::Relaxed);
        self.gauges.busy.store(busy, Ordering::Relaxed);
    }

    fn slot_of(&self, worker_id: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.id == worker_id)
    }

    fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Idle)
    }

    /// Availability is a hint: always try the oldest queued job first so a
    /// later arrival never jumps the queue.
    async fn on_available(&mut self, job_id: Uuid) {
        match self.jobs.next_queued().await {
            Some(head) => {
                if head != job_id {
                    debug!(job_id = %job_id, head = %head, "Dispatching queue head instead");
                }
                self.dispatch(head).await;
            }
            None => debug!(job_id = %job_id, "Nothing queued"),
        }
    }

    /// Hand one job to one idle unit.
    async fn dispatch(&mut self, job_id: Uuid) {
        if self.shutting_down {
            return;
        }
        let Some(index) = self.idle_slot() else {
            debug!(job_id = %job_id, "No idle worker, retrying later");
            self.schedule_retry();
            return;
        };

        let Some(job) = self.jobs.start_job(job_id).await else {
            // Claimed by an earlier dispatch, or evicted
            return;
        };

        let slot = &mut self.slots[index];
        let worker_id = slot.id;
        let task = UnitTask {
            job_id,
            messages: job.messages,
        };
        let sent = match &slot.tasks {
            Some(tasks) => tasks.try_send(task).map_err(|e| e.to_string()),
            None => Err("worker has no task channel".to_string()),
        };

        match sent {
            Ok(()) => {
                slot.state = SlotState::Busy;
                slot.current_job = Some(job_id);
                info!(job_id = %job_id, worker_id, "Job dispatched");
                self.publish();
                // More idle workers may be able to take the next job
                if self.idle_slot().is_some() {
                    self.jobs.process_queue().await;
                }
            }
            Err(e) => {
                // The unit is gone; its exit will trigger a respawn.
                slot.state = SlotState::Down;
                slot.tasks = None;
                warn!(job_id = %job_id, worker_id, error = %e, "Failed to send job to worker");
                self.publish();
                self.jobs
                    .complete_job(
                        job_id,
                        JobResult::failure(
                            format!("failed to send job to worker {worker_id}: {e}"),
                            ExecutionMetadata::instant(),
                        ),
                    )
                    .await;
                self.jobs.process_queue().await;
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_pending {
            return;
        }
        self.retry_pending = true;
        let commands = self.commands.clone();
        let delay = self.config.dispatch_retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(PoolCommand::Retry);
        });
    }

    async fn on_ready(&mut self, worker_id: u64) {
        let Some(index) = self.slot_of(worker_id) else {
            return;
        };
        if self.slots[index].state != SlotState::Starting {
            return;
        }
        self.slots[index].state = SlotState::Idle;
        debug!(worker_id, "Worker accepting jobs");
        self.publish();
        self.jobs.process_queue().await;
    }

    async fn on_report(&mut self, report: UnitReport) {
        if let Some(index) = self.slot_of(report.worker_id) {
            let slot = &mut self.slots[index];
            if slot.current_job == Some(report.job_id) {
                slot.current_job = None;
            }
            if report.exiting {
                // Keep it out of rotation until its exit is observed
                slot.state = SlotState::Down;
                slot.tasks = None;
            } else if slot.state == SlotState::Busy {
                slot.state = SlotState::Idle;
            }
            self.publish();
        }

        self.jobs.complete_job(report.job_id, report.result).await;
        self.jobs.process_queue().await;
    }

    async fn on_unit_exit(&mut self, joined: Result<(tokio::task::Id, UnitExit), JoinError>) {
        let (task_id, reason) = match joined {
            Ok((task_id, exit)) => (task_id, exit.to_string()),
            Err(e) if e.is_panic() => (e.id(), "worker panicked".to_string()),
            Err(e) => (e.id(), "worker cancelled".to_string()),
        };
        let Some(worker_id) = self.unit_workers.remove(&task_id) else {
            return;
        };
        let Some(index) = self.slot_of(worker_id) else {
            return;
        };

        let slot = &mut self.slots[index];
        slot.state = SlotState::Down;
        slot.tasks = None;
        if self.shutting_down {
            debug!(worker_id, reason = %reason, "Worker exited");
            self.publish();
            return;
        }
        let in_flight = slot.current_job.take();
        self.publish();
        warn!(worker_id, reason = %reason, "Worker exited, scheduling respawn");

        if let Some(job_id) = in_flight {
            self.jobs
                .complete_job(
                    job_id,
                    JobResult::failure(
                        format!("worker crashed: {reason}"),
                        ExecutionMetadata::instant(),
                    ),
                )
                .await;
        }

        let commands = self.commands.clone();
        let delay = self.config.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(PoolCommand::Respawn { slot: index });
        });
    }

    fn respawn(&mut self, index: usize, units: &mut JoinSet<UnitExit>) {
        if self.shutting_down || index >= self.slots.len() {
            return;
        }
        if self.slots[index].state != SlotState::Down {
            return;
        }
        let old_id = self.slots[index].id;
        let slot = self.spawn_unit(units);
        info!(old_worker_id = old_id, worker_id = slot.id, "Worker respawned");
        self.slots[index] = slot;
        self.publish();
    }

    /// Close every unit's task channel and wait for them to exit, racing the
    /// termination timeout. Units still running at the deadline are aborted.
    async fn shutdown(
        &mut self,
        units: &mut JoinSet<UnitExit>,
        events: &mut mpsc::UnboundedReceiver<UnitEvent>,
    ) -> ShutdownReport {
        self.shutting_down = true;
        info!(workers = units.len(), "Terminating worker pool");

        for slot in &mut self.slots {
            slot.tasks = None;
        }

        let deadline = tokio::time::Instant::now() + self.config.termination_timeout;
        let mut exited = 0;
        while !units.is_empty() {
            match tokio::time::timeout_at(deadline, units.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    exited += 1;
                    self.on_unit_exit(joined).await;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        let abandoned = units.len();
        if abandoned > 0 {
            warn!(abandoned, "Workers did not exit in time, aborting");
            units.abort_all();
        }

        // Results that raced the shutdown still count
        while let Ok(event) = events.try_recv() {
            let UnitEvent::Report(report) = event else {
                continue;
            };
            if let Some(index) = self.slot_of(report.worker_id)
                && self.slots[index].current_job == Some(report.job_id)
            {
                self.slots[index].current_job = None;
            }
            self.jobs.complete_job(report.job_id, report.result).await;
        }

        // Whatever is still in flight was abandoned with its unit
        let stranded: Vec<Uuid> = self
            .slots
            .iter_mut()
            .filter_map(|s| s.current_job.take())
            .collect();
        for job_id in stranded {
            self.jobs
                .complete_job(
                    job_id,
                    JobResult::failure(
                        "worker terminated during shutdown",
                        ExecutionMetadata::instant(),
                    ),
                )
                .await;
        }
        for slot in &mut self.slots {
            slot.state = SlotState::Down;
        }
        self.publish();

        info!(exited, abandoned, "Worker pool terminated");
        ShutdownReport { exited, abandoned }
    }
}
