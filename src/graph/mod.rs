//! Computation graphs — the pluggable unit a worker loads once and runs per job.
//!
//! A graph is anything implementing [`Graph`]. Workers never load code from
//! arbitrary input: a manifest file inside an allow-listed directory names a
//! graph kind, and the kind is resolved through a [`GraphRegistry`].

pub mod builtin;
pub mod loader;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::jobs::Message;

pub use loader::GraphLoader;
pub use registry::{GraphFactory, GraphRegistry};

/// State threaded through a graph execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub messages: Vec<Message>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl GraphState {
    /// Fresh state for a job's conversation.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Text of the last message, if any.
    pub fn last_content(&self) -> Option<&str> {
        self.messages.last().map(|m| m.content.as_str())
    }
}

/// Status a graph reports when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    Completed,
    Finished,
    Interrupted,
    Failed,
}

impl GraphStatus {
    /// Whether the run counts as a success.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Finished)
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Finished => "finished",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a graph returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphOutput {
    pub state: GraphState,
    pub status: GraphStatus,
}

/// A loaded computation graph.
#[async_trait]
pub trait Graph: Send + Sync {
    /// Run the graph to completion on `state`.
    async fn execute(&self, state: GraphState) -> Result<GraphOutput, GraphError>;
}
