//! Job manager — admission, state transitions and TTL cleanup over the job store.

use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Job, JobEvent, JobResult, JobStats, Message};
use super::store::JobStore;
use crate::config::JobManagerConfig;
use crate::error::JobError;

/// Lifecycle broadcast capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Single owner of every job record.
///
/// Availability notifications go to exactly one consumer (the worker pool)
/// over an unbounded channel; lifecycle events fan out over a broadcast
/// channel to any number of observers.
pub struct JobManager {
    config: JobManagerConfig,
    store: RwLock<JobStore>,
    available_tx: mpsc::UnboundedSender<Uuid>,
    available_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    events: broadcast::Sender<JobEvent>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Create a job manager and start its TTL sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: JobManagerConfig) -> Arc<Self> {
        let (available_tx, available_rx) = mpsc::unbounded_channel();
        let (events, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let interval = config.cleanup_interval;

        let manager = Arc::new(Self {
            config,
            store: RwLock::new(JobStore::new()),
            available_tx,
            available_rx: Mutex::new(Some(available_rx)),
            events,
            cleanup: Mutex::new(None),
        });

        let handle = spawn_cleanup_task(Arc::downgrade(&manager), interval);
        *lock(&manager.cleanup) = Some(handle);
        manager
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Take the availability stream. Only the first caller gets it.
    pub fn take_availability(&self) -> Option<mpsc::UnboundedReceiver<Uuid>> {
        lock(&self.available_rx).take()
    }

    /// Queue a new job, or reject it when the queue is at capacity.
    pub async fn submit(
        &self,
        messages: Vec<Message>,
        metadata: serde_json::Value,
    ) -> Result<Job, JobError> {
        let job = {
            let mut store = self.store.write().await;
            let active = store.active_count();
            if active >= self.config.max_queue_size {
                warn!(active, max = self.config.max_queue_size, "Rejected job: queue full");
                return Err(JobError::QueueFull {
                    max: self.config.max_queue_size,
                });
            }
            let job = Job::new(messages, metadata);
            store.insert(job.clone());
            job
        };

        info!(job_id = %job.id, messages = job.messages.len(), "Job queued");

        // Ok if nobody is listening
        let _ = self.events.send(JobEvent::Queued { id: job.id });
        self.notify_available(job.id);

        Ok(job)
    }

    /// Zero-based position among queued jobs; `None` if not queued.
    pub async fn queue_position(&self, id: Uuid) -> Option<usize> {
        self.store.read().await.queue_position(&id)
    }

    /// Atomically claim a queued job for a worker.
    ///
    /// Returns `None` if the job is no longer queued, so at most one caller
    /// ever receives a given job.
    pub async fn start_job(&self, id: Uuid) -> Option<Job> {
        let claimed = self.store.write().await.claim(&id, Utc::now());
        match &claimed {
            Some(_) => {
                debug!(job_id = %id, "Job started");
                let _ = self.events.send(JobEvent::Started { id });
            }
            None => debug!(job_id = %id, "Job not claimable"),
        }
        claimed
    }

    /// Record a job's terminal result. Unknown or finished jobs are ignored.
    pub async fn complete_job(&self, id: Uuid, result: JobResult) {
        let error = result.error.clone();
        let elapsed_ms = result.metadata.elapsed_ms;
        let status = self.store.write().await.finish(&id, result, Utc::now());

        match status {
            Some(status) => {
                if let Some(error) = &error {
                    warn!(job_id = %id, %status, elapsed_ms, error = %error, "Job finished");
                } else {
                    info!(job_id = %id, %status, elapsed_ms, "Job finished");
                }
                let _ = self.events.send(JobEvent::Completed { id, status });
            }
            None => debug!(job_id = %id, "Ignoring result for unknown or finished job"),
        }
    }

    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.store.read().await.get(&id).cloned()
    }

    pub async fn stats(&self) -> JobStats {
        self.store.read().await.stats()
    }

    /// Oldest queued job, if any.
    pub async fn next_queued(&self) -> Option<Uuid> {
        self.store.read().await.head()
    }

    /// Re-announce the head of the queue. Used to retry dispatch.
    pub async fn process_queue(&self) {
        if let Some(head) = self.next_queued().await {
            self.notify_available(head);
        }
    }

    /// Evict jobs whose TTL has elapsed. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let expired = self
            .store
            .write()
            .await
            .evict_expired(self.config.job_ttl, Utc::now());

        for id in &expired {
            debug!(job_id = %id, "Job expired");
            let _ = self.events.send(JobEvent::Expired { id: *id });
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired jobs");
        }
        expired.len()
    }

    /// Stop the TTL sweep. Safe to call any number of times.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = lock(&self.cleanup).take() {
            handle.abort();
            debug!("Job cleanup stopped");
        }
    }

    fn notify_available(&self, id: Uuid) {
        if self.available_tx.send(id).is_err() {
            debug!(job_id = %id, "No pool attached for availability notification");
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

/// Spawn the periodic TTL sweep. Exits once the manager is dropped.
fn spawn_cleanup_task(
    manager: Weak<JobManager>,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.cleanup_expired().await;
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
