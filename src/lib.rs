//! Convo Queue — bounded job queue and worker pool for conversational graphs.

pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod jobs;
pub mod worker;
