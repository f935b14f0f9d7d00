//! Validated graph lookup.
//!
//! A graph location is a JSON manifest (`{"kind": "...", "options": {...}}`)
//! that must resolve inside the configured base directory and carry an
//! allow-listed extension. The manifest's kind is resolved via the registry.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::graph::{Graph, GraphRegistry};

/// On-disk description of which graph to run.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphManifest {
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Resolves graph locations to loaded graphs.
pub struct GraphLoader {
    base_dir: PathBuf,
    allowed_extensions: Vec<String>,
    registry: Arc<GraphRegistry>,
}

impl GraphLoader {
    pub fn new(config: &GraphConfig, registry: Arc<GraphRegistry>) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            registry,
        }
    }

    /// Validate a location and return its resolved path.
    pub fn resolve(&self, location: &Path) -> Result<PathBuf, GraphError> {
        let resolved = contained_path(location, &self.base_dir)?;

        let extension = resolved
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or(GraphError::ExtensionNotAllowed)?;
        if !self.allowed_extensions.contains(&extension) {
            return Err(GraphError::ExtensionNotAllowed);
        }

        Ok(resolved)
    }

    /// Validate, read and build the graph at `location`.
    pub async fn load(&self, location: &Path) -> Result<Arc<dyn Graph>, GraphError> {
        let path = self.resolve(location)?;
        let raw = tokio::fs::read(&path).await?;
        let manifest: GraphManifest = serde_json::from_slice(&raw)?;
        tracing::debug!(kind = %manifest.kind, "Loaded graph manifest");
        self.registry.build(&manifest.kind, &manifest.options)
    }
}

/// Normalize a path by resolving `.` and `..` components lexically (no filesystem access).
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize as much of `path` as exists, re-appending the missing tail.
///
/// Symlinks in existing ancestors are followed, so a link pointing out of
/// the base directory is caught by the containment check.
fn canonical_or_nearest(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let mut ancestor = path;
    let mut tail_parts: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let mut result = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail_parts.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail_parts.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve `location` against `base_dir` and reject anything outside it.
fn contained_path(location: &Path, base_dir: &Path) -> Result<PathBuf, GraphError> {
    let joined = if location.is_absolute() {
        location.to_path_buf()
    } else {
        base_dir.join(location)
    };
    let resolved = canonical_or_nearest(&normalize_lexical(&joined));

    let base = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(base_dir)
    };
    let base_canonical = canonical_or_nearest(&normalize_lexical(&base));

    if resolved == base_canonical || !resolved.starts_with(&base_canonical) {
        return Err(GraphError::PathRejected);
    }
    Ok(resolved)
}
