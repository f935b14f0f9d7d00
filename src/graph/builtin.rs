//! Built-in graphs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::GraphError;
use crate::graph::{Graph, GraphOutput, GraphRegistry, GraphState, GraphStatus};
use crate::jobs::{Message, Role};

/// Register every built-in kind.
pub fn register(registry: &GraphRegistry) {
    registry.register(
        "echo",
        Arc::new(|options: &serde_json::Value| -> Result<Arc<dyn Graph>, GraphError> {
            Ok(Arc::new(EchoGraph::from_options(options)?))
        }),
    );
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EchoOptions {
    prefix: String,
}

/// Replies with the last user message.
#[derive(Debug, Default)]
pub struct EchoGraph {
    prefix: String,
}

impl EchoGraph {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn from_options(options: &serde_json::Value) -> Result<Self, GraphError> {
        if options.is_null() {
            return Ok(Self::default());
        }
        let options: EchoOptions =
            serde_json::from_value(options.clone()).map_err(|e| GraphError::Build {
                kind: "echo".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(options.prefix))
    }
}

#[async_trait]
impl Graph for EchoGraph {
    async fn execute(&self, mut state: GraphState) -> Result<GraphOutput, GraphError> {
        let last_user = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| GraphError::Execution("no user message to echo".to_string()))?;

        state
            .messages
            .push(Message::assistant(format!("{}{}", self.prefix, last_user)));

        Ok(GraphOutput {
            state,
            status: GraphStatus::Completed,
        })
    }
}
