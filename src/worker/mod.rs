//! Worker system — a fixed pool of isolated execution units.
//!
//! Core components:
//! - `unit` — Execution protocol of a single unit (load graph, run tasks under a timeout)
//! - `pool` — WorkerPool: dispatch, crash recovery, bounded shutdown

pub mod pool;
pub mod unit;

pub use pool::{PoolStats, ShutdownReport, WorkerPool};
pub use unit::{TIMEOUT_ERROR, UnitEvent, UnitExit, UnitReport, UnitTask};
