//! Job tracking — records, FIFO queue, admission and TTL cleanup.
//!
//! - `model` — Job types and the status state machine
//! - `store` — In-memory record store (no locking, no I/O)
//! - `manager` — `JobManager`, the async front door to the store

pub mod manager;
pub mod model;
pub mod store;

pub use manager::JobManager;
pub use model::{
    ExecutionMetadata, Job, JobEvent, JobResult, JobStats, JobStatus, Message, Role,
};
pub use store::JobStore;
