//! Job data model and state machine.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a conversational message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One role-tagged entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an idle worker.
    Queued,
    /// Handed to a worker.
    Running,
    /// Finished and the graph reported success.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the job still counts against the queue bound.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Timing of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionMetadata {
    pub fn between(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        let elapsed_ms = finished_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as u64;
        Self {
            elapsed_ms,
            started_at,
            finished_at,
        }
    }

    /// Metadata for a failure that never reached the graph.
    pub fn instant() -> Self {
        let now = Utc::now();
        Self::between(now, now)
    }
}

/// Structured outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Text of the last message the graph produced.
    pub content: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: ExecutionMetadata,
}

impl JobResult {
    pub fn success(content: Option<String>, metadata: ExecutionMetadata) -> Self {
        Self {
            content,
            success: true,
            error: None,
            metadata,
        }
    }

    pub fn failure(error: impl Into<String>, metadata: ExecutionMetadata) -> Self {
        Self {
            content: None,
            success: false,
            error: Some(error.into()),
            metadata,
        }
    }
}

/// A unit of submitted conversational work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub messages: Vec<Message>,
    /// Caller-supplied metadata, opaque to the queue.
    pub metadata: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    /// Short failure reason, set only when failed.
    pub error: Option<String>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(messages: Vec<Message>, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
            metadata,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Time spent running: start to completion, or start to `now` while running.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let started = self.started_at?;
        match (self.completed_at, self.status) {
            (Some(completed), _) => Some(completed - started),
            (None, JobStatus::Running) => Some(now - started),
            _ => None,
        }
    }

    /// Whether the TTL sweep may evict this job.
    ///
    /// Queued jobs age from creation, finished jobs from completion.
    /// Running jobs are never evicted.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let since = match self.status {
            JobStatus::Queued => self.created_at,
            JobStatus::Running => return false,
            JobStatus::Completed | JobStatus::Failed => match self.completed_at {
                Some(at) => at,
                None => self.created_at,
            },
        };
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now - since > ttl
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Lifecycle notification broadcast by the job manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Queued { id: Uuid },
    Started { id: Uuid },
    Completed { id: Uuid, status: JobStatus },
    Expired { id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(JobStatus::Running.to_string(), "running");
        let json = serde_json::to_string(&JobStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn role_parses_lowercase() {
        let msg: Message = serde_json::from_str(r#"{"role":"system","content":"be brief"}"#).unwrap();
        assert_eq!(msg, Message::system("be brief"));
        assert!(serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#).is_err());
    }

    #[test]
    fn duration_running_and_finished() {
        let mut job = Job::new(vec![Message::user("hi")], serde_json::Value::Null);
        let now = Utc::now();
        assert!(job.duration(now).is_none());

        job.status = JobStatus::Running;
        job.started_at = Some(now - TimeDelta::milliseconds(250));
        assert_eq!(job.duration(now), Some(TimeDelta::milliseconds(250)));

        job.status = JobStatus::Completed;
        job.completed_at = Some(now - TimeDelta::milliseconds(50));
        assert_eq!(job.duration(now), Some(TimeDelta::milliseconds(200)));
    }

    #[test]
    fn expiry_measured_from_completion_for_finished_jobs() {
        let ttl = Duration::from_millis(100);
        let now = Utc::now();
        let mut job = Job::new(vec![Message::user("hi")], serde_json::Value::Null);
        job.created_at = now - TimeDelta::seconds(10);
        assert!(job.is_expired(ttl, now));

        job.status = JobStatus::Running;
        job.started_at = Some(now - TimeDelta::seconds(9));
        assert!(!job.is_expired(ttl, now));

        job.status = JobStatus::Completed;
        job.completed_at = Some(now - TimeDelta::milliseconds(10));
        assert!(!job.is_expired(ttl, now));

        job.completed_at = Some(now - TimeDelta::milliseconds(500));
        assert!(job.is_expired(ttl, now));
    }

    #[test]
    fn job_serializes_camel_case() {
        let mut job = Job::new(vec![Message::user("hi")], serde_json::Value::Null);
        job.started_at = Some(job.created_at);
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("startedAt").is_some());
        assert!(json.get("completedAt").is_some());
        assert!(json.get("created_at").is_none());
        assert_eq!(json["status"], "queued");
    }

    #[test]
    fn execution_metadata_elapsed() {
        let start = Utc::now();
        let meta = ExecutionMetadata::between(start, start + TimeDelta::milliseconds(1500));
        assert_eq!(meta.elapsed_ms, 1500);
        let backwards = ExecutionMetadata::between(start, start - TimeDelta::seconds(1));
        assert_eq!(backwards.elapsed_ms, 0);
    }
}
