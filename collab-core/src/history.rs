//! # Operation History
//!
//! Authoritative cell state for a live diagram plus a bounded log of the
//! changes that produced it.
//!
//! ```text
//! base ──log[0]──▶ ... ──log[cursor-1]──▶ current ──log[cursor..]──▶ (redo tail)
//! ```
//!
//! Replaying `log[..cursor]` onto `base` always yields `current`. Entries
//! evicted past the capacity are folded into `base`, so the invariant holds
//! regardless of how long the session runs.

use std::collections::{HashMap, VecDeque};

use crate::diagram::{current_timestamp_ms, CellState, Diagram};
use crate::patch::{
    apply_changes, apply_patch, AppliedPatch, CellChange, CellPatch, PatchRejection,
};

/// Default number of log entries kept for undo and resync.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// An accepted operation as recorded in the log.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Sequence number assigned when the operation was accepted.
    pub sequence_number: u64,
    /// Client-supplied operation id.
    pub operation_id: String,
    /// Provider id of the user who sent it.
    pub user_id: String,
    /// The effective patch.
    pub patch: CellPatch,
    /// Net per-cell changes.
    pub changes: Vec<CellChange>,
    /// Acceptance time (ms since epoch).
    pub applied_at: u64,
}

/// Direction of a history step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDirection {
    /// Revert the most recent entry.
    Undo,
    /// Re-apply the most recently undone entry.
    Redo,
}

impl HistoryDirection {
    /// Wire name of the direction.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// A prepared undo or redo, not yet committed.
#[derive(Debug, Clone)]
pub struct HistoryStep {
    /// Undo or redo.
    pub direction: HistoryDirection,
    /// Operation id of the entry being reverted or re-applied.
    pub operation_id: String,
    /// State after the step.
    pub state: CellState,
    /// Changes the step performs.
    pub changes: Vec<CellChange>,
    /// Patch equivalent of `changes`, for broadcasting.
    pub patch: CellPatch,
}

/// Authoritative state and bounded operation log for one diagram.
#[derive(Debug, Clone)]
pub struct OperationHistory {
    base: CellState,
    current: CellState,
    log: VecDeque<HistoryEntry>,
    cursor: usize,
    capacity: usize,
    cell_versions: HashMap<String, u64>,
    last_sequence: u64,
}

impl OperationHistory {
    /// Create a history whose base is `initial`, last changed at `last_sequence`.
    #[must_use]
    pub fn new(initial: CellState, last_sequence: u64, capacity: usize) -> Self {
        Self {
            base: initial.clone(),
            current: initial,
            log: VecDeque::new(),
            cursor: 0,
            capacity: capacity.max(1),
            cell_versions: HashMap::new(),
            last_sequence,
        }
    }

    /// Create a history from a persisted diagram.
    #[must_use]
    pub fn from_diagram(diagram: &Diagram, capacity: usize) -> Self {
        Self::new(
            CellState::from_cells(&diagram.cells),
            diagram.update_vector,
            capacity,
        )
    }

    /// The authoritative cell state.
    #[must_use]
    pub fn current_state(&self) -> &CellState {
        &self.current
    }

    /// Sequence number of the last accepted change.
    #[must_use]
    pub fn update_vector(&self) -> u64 {
        self.last_sequence
    }

    /// Entries currently in effect, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.log.iter().take(self.cursor)
    }

    /// Number of entries in effect.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor
    }

    /// Whether no entries are in effect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Whether an undo is possible.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    /// Whether a redo is possible.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.cursor < self.log.len()
    }

    /// Cells among `ids` changed by a sequence number above `base_vector`.
    #[must_use]
    pub fn modified_since<'a>(
        &self,
        base_vector: u64,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut stale: Vec<String> = Vec::new();
        for id in ids {
            let changed_after = self
                .cell_versions
                .get(id)
                .is_some_and(|version| *version > base_vector);
            if changed_after && !stale.iter().any(|s| s == id) {
                stale.push(id.to_string());
            }
        }
        stale
    }

    /// Validate a patch against the current state without committing it.
    ///
    /// `base_vector` is the update vector the client last saw; cells changed
    /// after it are treated as conflicting.
    ///
    /// # Errors
    ///
    /// Returns the [`PatchRejection`] produced by validation or the staleness check.
    pub fn prepare(
        &self,
        patch: &CellPatch,
        base_vector: Option<u64>,
    ) -> Result<AppliedPatch, PatchRejection> {
        if let Some(base_vector) = base_vector {
            let touched = patch.cells.iter().map(|op| op.id.as_str());
            let stale = if base_vector > self.last_sequence {
                let mut all: Vec<String> = Vec::new();
                for id in touched {
                    if !all.iter().any(|s| s == id) {
                        all.push(id.to_string());
                    }
                }
                all
            } else {
                self.modified_since(base_vector, touched)
            };
            if !stale.is_empty() {
                return Err(PatchRejection::conflict(stale));
            }
        }
        apply_patch(&self.current, patch)
    }

    /// Commit a prepared patch under `sequence_number`.
    ///
    /// Discards any redo tail and evicts the oldest entry past capacity.
    pub fn commit(
        &mut self,
        sequence_number: u64,
        operation_id: &str,
        user_id: &str,
        applied: AppliedPatch,
    ) -> &HistoryEntry {
        self.log.truncate(self.cursor);
        self.current = applied.state;
        self.touch(sequence_number, &applied.changes);
        self.log.push_back(HistoryEntry {
            sequence_number,
            operation_id: operation_id.to_string(),
            user_id: user_id.to_string(),
            patch: applied.patch,
            changes: applied.changes,
            applied_at: current_timestamp_ms(),
        });
        self.cursor = self.log.len();

        while self.log.len() > self.capacity {
            if let Some(evicted) = self.log.pop_front() {
                apply_changes(&mut self.base, &evicted.changes);
                self.cursor -= 1;
            }
        }

        &self.log[self.cursor - 1]
    }

    /// Prepare an undo of the most recent entry in effect.
    #[must_use]
    pub fn prepare_undo(&self) -> Option<HistoryStep> {
        let entry = self.log.get(self.cursor.checked_sub(1)?)?;
        let changes: Vec<CellChange> = entry.changes.iter().rev().map(CellChange::inverted).collect();
        Some(self.step(HistoryDirection::Undo, &entry.operation_id, changes))
    }

    /// Prepare a redo of the most recently undone entry.
    #[must_use]
    pub fn prepare_redo(&self) -> Option<HistoryStep> {
        let entry = self.log.get(self.cursor)?;
        Some(self.step(HistoryDirection::Redo, &entry.operation_id, entry.changes.clone()))
    }

    /// Commit a prepared undo or redo under `sequence_number`.
    pub fn commit_step(&mut self, sequence_number: u64, step: HistoryStep) {
        self.current = step.state;
        self.touch(sequence_number, &step.changes);
        match step.direction {
            HistoryDirection::Undo => self.cursor = self.cursor.saturating_sub(1),
            HistoryDirection::Redo => self.cursor = (self.cursor + 1).min(self.log.len()),
        }
    }

    /// Recompute the state by replaying the entries in effect onto the base.
    #[must_use]
    pub fn replay(&self) -> CellState {
        let mut state = self.base.clone();
        for entry in self.entries() {
            apply_changes(&mut state, &entry.changes);
        }
        state
    }

    fn step(
        &self,
        direction: HistoryDirection,
        operation_id: &str,
        changes: Vec<CellChange>,
    ) -> HistoryStep {
        let mut state = self.current.clone();
        apply_changes(&mut state, &changes);
        let patch = CellPatch::new(changes.iter().map(CellChange::to_operation).collect());
        HistoryStep {
            direction,
            operation_id: operation_id.to_string(),
            state,
            changes,
            patch,
        }
    }

    fn touch(&mut self, sequence_number: u64, changes: &[CellChange]) {
        for change in changes {
            self.cell_versions.insert(change.id.clone(), sequence_number);
        }
        self.last_sequence = self.last_sequence.max(sequence_number);
    }
}
