//! Job record store: every known job plus the FIFO order of queued ones.
//!
//! Pure data and transition logic. Locking and notifications belong to
//! [`JobManager`](super::JobManager).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{Job, JobResult, JobStats, JobStatus};

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    /// Ids of queued jobs in arrival order.
    queue: VecDeque<Uuid>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created job, queueing it if it is queued.
    pub fn insert(&mut self, job: Job) {
        if job.status == JobStatus::Queued {
            self.queue.push_back(job.id);
        }
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Number of jobs that are queued or running.
    pub fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| j.status.is_active()).count()
    }

    /// Zero-based rank among queued jobs, `None` when not queued.
    pub fn queue_position(&self, id: &Uuid) -> Option<usize> {
        self.queue.iter().position(|queued| queued == id)
    }

    /// Oldest queued job.
    pub fn head(&self) -> Option<Uuid> {
        self.queue.front().copied()
    }

    /// Move a queued job to running. Returns `None` if it is not queued.
    ///
    /// This check-and-set is the only way a job reaches a worker.
    pub fn claim(&mut self, id: &Uuid, now: DateTime<Utc>) -> Option<Job> {
        let job = self.jobs.get_mut(id)?;
        if !job.status.can_transition_to(JobStatus::Running) {
            return None;
        }

        job.status = JobStatus::Running;
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        let claimed = job.clone();
        self.queue.retain(|queued| queued != id);
        Some(claimed)
    }

    /// Record a terminal result. Returns the new status, or `None` if the
    /// job is unknown or already finished.
    pub fn finish(&mut self, id: &Uuid, result: JobResult, now: DateTime<Utc>) -> Option<JobStatus> {
        let job = self.jobs.get_mut(id)?;
        let target = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !job.status.can_transition_to(target) {
            return None;
        }

        let was_queued = job.status == JobStatus::Queued;
        job.status = target;
        // Never earlier than the start, even if clocks disagree.
        let completed_at = match job.started_at {
            Some(started) if started > now => started,
            _ => now,
        };
        job.completed_at = Some(completed_at);
        job.error = if result.success {
            None
        } else {
            result.error.clone()
        };
        job.result = Some(result);

        if was_queued {
            self.queue.retain(|queued| queued != id);
        }
        Some(target)
    }

    /// Remove every job whose TTL has elapsed. Returns the evicted ids.
    pub fn evict_expired(&mut self, ttl: Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|job| job.is_expired(ttl, now))
            .map(|job| job.id)
            .collect();

        for id in &expired {
            self.jobs.remove(id);
        }
        if !expired.is_empty() {
            self.queue.retain(|queued| !expired.contains(queued));
        }
        expired
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats {
            total: self.jobs.len(),
            ..JobStats::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
