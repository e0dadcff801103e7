//! Cell patch validation and application.
//!
//! A patch is applied to a working copy of the authoritative [`CellState`].
//! The copy only replaces the authoritative state when the whole patch is
//! accepted, so a rejected patch never leaves partial changes behind.

use serde::{Deserialize, Serialize};

use crate::cell::Cell;
use crate::diagram::CellState;

/// The only operation type diagrams accept.
pub const PATCH_OPERATION_TYPE: &str = "patch";
/// Maximum cell operations in a single patch.
pub const MAX_CELL_OPERATIONS: usize = 1_000;
/// Maximum length of a cell identifier.
pub const MAX_CELL_ID_LEN: usize = 64;

/// Check a cell identifier: 1-64 characters, alphanumeric, hyphen or underscore.
#[must_use]
pub fn is_valid_cell_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CELL_ID_LEN
        && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// What a single cell operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellOperationKind {
    /// Create a cell (an existing id is treated as an update).
    Add,
    /// Replace an existing cell.
    Update,
    /// Delete a cell.
    Remove,
    /// Any operation name this server does not know.
    #[serde(other)]
    Unknown,
}

impl CellOperationKind {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Unknown => "unknown",
        }
    }
}

/// One cell-level change inside a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOperation {
    /// Target cell.
    pub id: String,
    /// What to do with it.
    pub operation: CellOperationKind,
    /// Full cell value for add and update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// The value the client believes the cell currently has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<serde_json::Value>,
}

impl CellOperation {
    /// Add a cell.
    #[must_use]
    pub fn add(cell: &Cell) -> Self {
        Self::with_data(cell, CellOperationKind::Add)
    }

    /// Update a cell to `cell`.
    #[must_use]
    pub fn update(cell: &Cell) -> Self {
        Self::with_data(cell, CellOperationKind::Update)
    }

    /// Remove the cell `id`.
    #[must_use]
    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: CellOperationKind::Remove,
            data: None,
            previous: None,
        }
    }

    /// Assert the value the cell is expected to have before this operation.
    #[must_use]
    pub fn expecting(mut self, previous: &Cell) -> Self {
        self.previous = serde_json::to_value(previous).ok();
        self
    }

    fn with_data(cell: &Cell, operation: CellOperationKind) -> Self {
        Self {
            id: cell.id().to_string(),
            operation,
            data: serde_json::to_value(cell).ok(),
            previous: None,
        }
    }
}

/// A set of cell operations applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPatch {
    /// Operation type, always `patch`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Cell operations in application order.
    #[serde(default)]
    pub cells: Vec<CellOperation>,
}

impl CellPatch {
    /// Build a patch from cell operations.
    #[must_use]
    pub fn new(cells: Vec<CellOperation>) -> Self {
        Self {
            kind: PATCH_OPERATION_TYPE.to_string(),
            cells,
        }
    }
}

/// Machine-readable reason an operation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The diagram no longer exists in the store.
    DiagramNotFound,
    /// Persisting the change failed.
    SaveFailed,
    /// The client's view of a cell is stale.
    ConflictDetected,
    /// The operation type is not `patch`.
    InvalidOperationType,
    /// The patch has no cell operations.
    EmptyOperation,
    /// A cell operation is malformed.
    ValidationFailed,
    /// The patch would not change anything.
    NoStateChange,
}

impl RejectReason {
    /// Wire name of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DiagramNotFound => "diagram_not_found",
            Self::SaveFailed => "save_failed",
            Self::ConflictDetected => "conflict_detected",
            Self::InvalidOperationType => "invalid_operation_type",
            Self::EmptyOperation => "empty_operation",
            Self::ValidationFailed => "validation_failed",
            Self::NoStateChange => "no_state_change",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a patch was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct PatchRejection {
    /// Machine-readable reason.
    pub reason: RejectReason,
    /// Human-readable message.
    pub message: String,
    /// Extra diagnostic detail.
    pub details: Option<String>,
    /// Cells the rejection is about.
    pub affected_cells: Vec<String>,
}

impl PatchRejection {
    /// Create a rejection without details or affected cells.
    #[must_use]
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            details: None,
            affected_cells: Vec::new(),
        }
    }

    /// Attach details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Build a conflict rejection naming the stale cells.
    #[must_use]
    pub fn conflict(cells: Vec<String>) -> Self {
        Self {
            reason: RejectReason::ConflictDetected,
            message: format!("Conflict detected on cells: {}", cells.join(", ")),
            details: None,
            affected_cells: cells,
        }
    }

    fn invalid(details: impl Into<String>, cell: &str) -> Self {
        Self {
            reason: RejectReason::ValidationFailed,
            message: "Cell operation validation failed".to_string(),
            details: Some(details.into()),
            affected_cells: vec![cell.to_string()],
        }
    }

    /// Whether the client must fetch the full state before retrying.
    #[must_use]
    pub fn requires_resync(&self) -> bool {
        self.reason == RejectReason::ConflictDetected
    }
}

/// Before and after value of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    /// Cell identifier.
    pub id: String,
    /// Value before the patch, `None` if the cell did not exist.
    pub before: Option<Cell>,
    /// Value after the patch, `None` if the cell was removed.
    pub after: Option<Cell>,
    /// Where a removed cell sat in diagram order, so reverting puts it back.
    pub index: Option<usize>,
}

impl CellChange {
    /// The change that reverts this one.
    #[must_use]
    pub fn inverted(&self) -> Self {
        Self {
            id: self.id.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
            index: self.index,
        }
    }

    /// The cell operation that performs this change.
    #[must_use]
    pub fn to_operation(&self) -> CellOperation {
        match (&self.before, &self.after) {
            (_, None) => CellOperation::remove(self.id.clone()),
            (None, Some(cell)) => CellOperation::add(cell),
            (Some(_), Some(cell)) => CellOperation::update(cell),
        }
    }
}

/// A patch that validated and changed state.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    /// The working state after the patch.
    pub state: CellState,
    /// Net per-cell changes, one per modified cell.
    pub changes: Vec<CellChange>,
    /// The operations that took effect, duplicates and no-ops removed.
    pub patch: CellPatch,
}

impl AppliedPatch {
    /// Ids of the modified cells, each listed once.
    #[must_use]
    pub fn cells_modified(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.id.clone()).collect()
    }
}

/// Validate `patch` against `state` and apply it to a working copy.
///
/// # Errors
///
/// Returns a [`PatchRejection`] when the operation type is wrong, the patch
/// is empty or malformed, a cell assumption is stale, or nothing changes.
pub fn apply_patch(state: &CellState, patch: &CellPatch) -> Result<AppliedPatch, PatchRejection> {
    if patch.kind != PATCH_OPERATION_TYPE {
        return Err(PatchRejection::new(
            RejectReason::InvalidOperationType,
            "Unsupported operation type",
        )
        .with_details(format!(
            "Operation type must be '{PATCH_OPERATION_TYPE}', got: {}",
            patch.kind
        )));
    }
    if patch.cells.is_empty() {
        return Err(PatchRejection::new(
            RejectReason::EmptyOperation,
            "Operation contains no cell changes",
        ));
    }
    if patch.cells.len() > MAX_CELL_OPERATIONS {
        return Err(
            PatchRejection::new(RejectReason::ValidationFailed, "Too many cell operations")
                .with_details(format!("max {MAX_CELL_OPERATIONS} cell operations per patch")),
        );
    }

    let mut working = state.clone();
    let mut changes: Vec<CellChange> = Vec::new();
    let mut effective = Vec::new();
    let mut conflicts = Vec::new();

    for op in dedup_operations(&patch.cells) {
        if !is_valid_cell_id(&op.id) {
            return Err(PatchRejection::invalid(
                format!("invalid cell id '{}'", op.id),
                &op.id,
            ));
        }
        let current = working.get(&op.id).cloned();

        if let Some(previous) = &op.previous {
            let expected = Cell::from_value(previous).map_err(|e| {
                PatchRejection::invalid(format!("cell {}: invalid previous value: {e}", op.id), &op.id)
            })?;
            if current.as_ref() != Some(&expected) {
                conflicts.push(op.id.clone());
                continue;
            }
        }

        let after = match op.operation {
            CellOperationKind::Unknown => {
                return Err(PatchRejection::invalid(
                    format!("cell {}: unknown cell operation", op.id),
                    &op.id,
                ));
            }
            CellOperationKind::Remove => None,
            CellOperationKind::Add | CellOperationKind::Update => {
                if op.operation == CellOperationKind::Update && current.is_none() {
                    conflicts.push(op.id.clone());
                    continue;
                }
                let cell = parse_cell(op)?;
                for reference in cell.references() {
                    if reference == op.id || !working.contains(reference) {
                        return Err(PatchRejection::invalid(
                            format!("cell {} references unknown cell '{reference}'", op.id),
                            &op.id,
                        ));
                    }
                }
                Some(cell)
            }
        };

        if after == current {
            continue;
        }
        working.set(&op.id, after.clone());
        record_change(&mut changes, &op.id, current, after);
        effective.push(op.clone());
    }

    if !conflicts.is_empty() {
        return Err(PatchRejection::conflict(conflicts));
    }

    changes.retain(|change| change.before != change.after);
    for removed in changes.iter().filter(|c| c.after.is_none()) {
        if let Some(dependent) = working
            .iter()
            .find(|cell| cell.references().contains(&removed.id.as_str()))
        {
            return Err(PatchRejection::invalid(
                format!(
                    "cell {} is still referenced by '{}'",
                    removed.id,
                    dependent.id()
                ),
                &removed.id,
            ));
        }
    }
    if changes.is_empty() {
        return Err(PatchRejection::new(
            RejectReason::NoStateChange,
            "Operation resulted in no state changes (idempotent or no-op)",
        ));
    }

    let mut next = state.clone();
    for change in &mut changes {
        if change.after.is_none() {
            change.index = next.position(&change.id);
        }
        apply_changes(&mut next, std::slice::from_ref(change));
    }
    Ok(AppliedPatch {
        state: next,
        changes,
        patch: CellPatch::new(effective),
    })
}

/// Apply already-validated changes to a state.
///
/// A change that brings back a removed cell restores its recorded position.
pub fn apply_changes(state: &mut CellState, changes: &[CellChange]) {
    for change in changes {
        match (&change.after, change.index) {
            (Some(cell), Some(index)) => state.restore(cell.clone(), index),
            (after, _) => state.set(&change.id, after.clone()),
        }
    }
}

fn parse_cell(op: &CellOperation) -> Result<Cell, PatchRejection> {
    let data = op.data.as_ref().ok_or_else(|| {
        PatchRejection::invalid(
            format!("cell {}: {} requires cell data", op.id, op.operation.as_str()),
            &op.id,
        )
    })?;
    let cell = Cell::from_value(data).map_err(|e| {
        PatchRejection::invalid(format!("cell {}: invalid cell data: {e}", op.id), &op.id)
    })?;
    if cell.id() != op.id {
        return Err(PatchRejection::invalid(
            format!("cell data id '{}' does not match operation id '{}'", cell.id(), op.id),
            &op.id,
        ));
    }
    Ok(cell)
}

/// Drop exact repeats of an earlier operation, keeping the first.
fn dedup_operations(ops: &[CellOperation]) -> Vec<&CellOperation> {
    let mut unique: Vec<&CellOperation> = Vec::with_capacity(ops.len());
    for op in ops {
        if !unique.iter().any(|seen| *seen == op) {
            unique.push(op);
        }
    }
    unique
}

/// Merge a change into the net change list: first `before`, last `after`.
fn record_change(
    changes: &mut Vec<CellChange>,
    id: &str,
    before: Option<Cell>,
    after: Option<Cell>,
) {
    if let Some(existing) = changes.iter_mut().find(|c| c.id == id) {
        existing.after = after;
    } else {
        changes.push(CellChange {
            id: id.to_string(),
            before,
            after,
            index: None,
        });
    }
}
