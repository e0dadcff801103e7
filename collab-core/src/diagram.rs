//! Persisted diagram records and the in-memory cell state built from them.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cell::Cell;

/// A diagram as held by the diagram store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    /// Diagram identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Owning threat model, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_model_id: Option<String>,
    /// Cells in diagram order.
    #[serde(default)]
    pub cells: Vec<Cell>,
    /// Sequence number of the last change persisted to this diagram.
    #[serde(default)]
    pub update_vector: u64,
    /// Last modification time (ms since epoch).
    #[serde(default)]
    pub modified_at: u64,
}

impl Diagram {
    /// Create an empty diagram.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            threat_model_id: None,
            cells: Vec::new(),
            update_vector: 0,
            modified_at: current_timestamp_ms(),
        }
    }

    /// Attach the diagram to a threat model.
    #[must_use]
    pub fn in_threat_model(mut self, threat_model_id: impl Into<String>) -> Self {
        self.threat_model_id = Some(threat_model_id.into());
        self
    }

    /// Replace the cell list.
    #[must_use]
    pub fn with_cells(mut self, cells: Vec<Cell>) -> Self {
        self.cells = cells;
        self
    }

    /// Copy of this diagram carrying `state` at `update_vector`.
    #[must_use]
    pub fn with_state(&self, state: &CellState, update_vector: u64) -> Self {
        Self {
            cells: state.to_cells(),
            update_vector,
            modified_at: current_timestamp_ms(),
            ..self.clone()
        }
    }
}

/// Ordered cell-id to cell map.
///
/// Keeps the order in which cells were first inserted so snapshots list
/// cells in diagram order. Two states are equal only if they list the same
/// cells in the same order.
#[derive(Debug, Clone, Default)]
pub struct CellState {
    cells: HashMap<String, Cell>,
    order: Vec<String>,
}

impl CellState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the state from a diagram's cell list.
    ///
    /// A repeated id keeps its first position and its last value.
    #[must_use]
    pub fn from_cells(cells: &[Cell]) -> Self {
        let mut state = Self::new();
        for cell in cells {
            state.insert(cell.clone());
        }
        state
    }

    /// Look up a cell.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    /// Whether a cell exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.cells.contains_key(id)
    }

    /// Insert or replace a cell, returning the previous value.
    pub fn insert(&mut self, cell: Cell) -> Option<Cell> {
        let id = cell.id().to_string();
        let previous = self.cells.insert(id.clone(), cell);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    /// Put `cell` back at `index` in diagram order, or replace it in place if
    /// it is present. An index past the end appends.
    pub fn restore(&mut self, cell: Cell, index: usize) {
        let id = cell.id().to_string();
        if self.cells.insert(id.clone(), cell).is_none() {
            let index = index.min(self.order.len());
            self.order.insert(index, id);
        }
    }

    /// Position of a cell in diagram order.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|existing| existing == id)
    }

    /// Remove a cell, returning it if it existed.
    pub fn remove(&mut self, id: &str) -> Option<Cell> {
        let removed = self.cells.remove(id);
        if removed.is_some() {
            self.order.retain(|existing| existing != id);
        }
        removed
    }

    /// Set a cell to `value`, removing it when `value` is `None`.
    pub fn set(&mut self, id: &str, value: Option<Cell>) {
        match value {
            Some(cell) => {
                self.insert(cell);
            }
            None => {
                self.remove(id);
            }
        }
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the state has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate cells in diagram order.
    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.order.iter().filter_map(|id| self.cells.get(id))
    }

    /// Cells in diagram order.
    #[must_use]
    pub fn to_cells(&self) -> Vec<Cell> {
        self.iter().cloned().collect()
    }
}

impl PartialEq for CellState {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.cells == other.cells
    }
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| {
        // Timestamp will not exceed u64 max for millennia
        #[allow(clippy::cast_possible_truncation)]
        {
            d.as_millis() as u64
        }
    })
}
