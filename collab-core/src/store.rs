//! Diagram storage.
//!
//! [`DiagramStore`] is the persistence collaborator sessions are built
//! against. [`MemoryDiagramStore`] keeps diagrams in memory and, when given
//! a data directory, mirrors every write to one JSON file per diagram.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::diagram::Diagram;
use crate::error::StoreError;

/// Persistent diagram storage.
#[async_trait]
pub trait DiagramStore: Send + Sync {
    /// Fetch a diagram.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DiagramNotFound`] if the diagram does not exist.
    async fn get(&self, diagram_id: &str) -> Result<Diagram, StoreError>;

    /// Replace an existing diagram.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DiagramNotFound`] if the diagram does not exist,
    /// or another [`StoreError`] if the write fails.
    async fn update(&self, diagram_id: &str, diagram: Diagram) -> Result<(), StoreError>;

    /// Create or replace a diagram.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the write fails.
    async fn put(&self, diagram: Diagram) -> Result<(), StoreError>;
}

/// Thread-safe in-memory diagram store with optional JSON persistence.
///
/// # Example
///
/// ```
/// use collab_core::store::MemoryDiagramStore;
/// use collab_core::Diagram;
///
/// let store = MemoryDiagramStore::new();
/// store.insert(Diagram::new("d1", "Data flows"));
/// assert_eq!(store.ids(), vec!["d1".to_string()]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDiagramStore {
    diagrams: Arc<RwLock<HashMap<String, Diagram>>>,
    /// Optional data directory for filesystem persistence.
    data_dir: Option<PathBuf>,
}

impl MemoryDiagramStore {
    /// Create an empty store without persistence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store persisted to `data_dir`, loading any diagrams found there.
    ///
    /// The directory is created if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created or read,
    /// or [`StoreError::Serialization`] if a diagram file is malformed.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let mut diagrams = HashMap::new();
        for entry in std::fs::read_dir(&data_dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let diagram: Diagram = serde_json::from_str(&contents).map_err(|e| {
                StoreError::Serialization(format!("{}: {e}", path.display()))
            })?;
            diagrams.insert(diagram.id.clone(), diagram);
        }
        tracing::info!(
            count = diagrams.len(),
            dir = %data_dir.display(),
            "Loaded persisted diagrams"
        );

        Ok(Self {
            diagrams: Arc::new(RwLock::new(diagrams)),
            data_dir: Some(data_dir),
        })
    }

    /// Insert or replace a diagram synchronously.
    pub fn insert(&self, diagram: Diagram) {
        let id = diagram.id.clone();
        {
            let mut diagrams = self
                .diagrams
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            diagrams.insert(id.clone(), diagram);
        }
        self.persist(&id);
    }

    /// Remove a diagram and its file.
    pub fn remove(&self, diagram_id: &str) -> Option<Diagram> {
        let removed = self
            .diagrams
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(diagram_id);
        if let Some(path) = self.path_for(diagram_id) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to delete diagram file {}: {e}", path.display());
                }
            }
        }
        removed
    }

    /// Ids of all stored diagrams, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let diagrams = self
            .diagrams
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = diagrams.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn path_for(&self, diagram_id: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", sanitize_filename(diagram_id))))
    }

    /// Write a diagram to disk. No-op without a data directory.
    fn persist(&self, diagram_id: &str) {
        let Some(path) = self.path_for(diagram_id) else {
            return;
        };
        let json = {
            let diagrams = self
                .diagrams
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(diagram) = diagrams.get(diagram_id) else {
                return;
            };
            match serde_json::to_string_pretty(diagram) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to serialize diagram {diagram_id}: {e}");
                    return;
                }
            }
        };
        if let Err(e) = std::fs::write(&path, json) {
            tracing::warn!(
                "Failed to persist diagram {diagram_id} to {}: {e}",
                path.display()
            );
        }
    }
}

#[async_trait]
impl DiagramStore for MemoryDiagramStore {
    async fn get(&self, diagram_id: &str) -> Result<Diagram, StoreError> {
        let diagrams = self
            .diagrams
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        diagrams
            .get(diagram_id)
            .cloned()
            .ok_or_else(|| StoreError::DiagramNotFound(diagram_id.to_string()))
    }

    async fn update(&self, diagram_id: &str, diagram: Diagram) -> Result<(), StoreError> {
        {
            let mut diagrams = self
                .diagrams
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let slot = diagrams
                .get_mut(diagram_id)
                .ok_or_else(|| StoreError::DiagramNotFound(diagram_id.to_string()))?;
            *slot = diagram;
        }
        self.persist(diagram_id);
        Ok(())
    }

    async fn put(&self, diagram: Diagram) -> Result<(), StoreError> {
        self.insert(diagram);
        Ok(())
    }
}

/// Sanitize a diagram ID for use as a filename.
///
/// Replaces any character that is not alphanumeric, `-`, or `_` with `_`.
fn sanitize_filename(diagram_id: &str) -> String {
    diagram_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
