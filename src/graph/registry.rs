//! Registry of graph kinds that manifests may name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::GraphError;
use crate::graph::Graph;

/// Builds a graph from a manifest's `options`.
pub trait GraphFactory: Send + Sync {
    fn build(&self, options: &serde_json::Value) -> Result<Arc<dyn Graph>, GraphError>;
}

impl<F> GraphFactory for F
where
    F: Fn(&serde_json::Value) -> Result<Arc<dyn Graph>, GraphError> + Send + Sync,
{
    fn build(&self, options: &serde_json::Value) -> Result<Arc<dyn Graph>, GraphError> {
        self(options)
    }
}

/// Known graph kinds.
#[derive(Default)]
pub struct GraphRegistry {
    factories: RwLock<HashMap<String, Arc<dyn GraphFactory>>>,
}

impl GraphRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in graphs.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::graph::builtin::register(&registry);
        registry
    }

    /// Register a factory, replacing any previous one for `kind`.
    pub fn register(&self, kind: impl Into<String>, factory: Arc<dyn GraphFactory>) {
        let kind = kind.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if factories.insert(kind.clone(), factory).is_some() {
            tracing::warn!(kind = %kind, "Replaced graph factory");
        } else {
            tracing::debug!("Registered graph kind: {}", kind);
        }
    }

    /// Build a graph of `kind`.
    pub fn build(
        &self,
        kind: &str,
        options: &serde_json::Value,
    ) -> Result<Arc<dyn Graph>, GraphError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .cloned()
            .ok_or_else(|| GraphError::UnknownKind {
                kind: kind.to_string(),
            })?;
        factory.build(options)
    }

    /// List registered kinds.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}
