//! # Collab Core
//!
//! Diagram model and operation history for real-time collaborative
//! threat-model editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                collab-core                  │
//! ├─────────────────────────────────────────────┤
//! │  Cells           │  Operation History       │
//! │  - Nodes, edges  │  - Authoritative state   │
//! │  - Cell patches  │  - Bounded log, undo     │
//! ├─────────────────────────────────────────────┤
//! │  Collaborators                              │
//! │  - DiagramStore  - AuthorizationService     │
//! │  - IdentityResolver                         │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod authz;
pub mod cell;
pub mod diagram;
pub mod error;
pub mod history;
pub mod identity;
pub mod patch;
pub mod store;

pub use authz::{AuthorizationService, StaticAuthorization};
pub use cell::{Cell, Edge, EdgeShape, EdgeTerminal, Node, NodeShape, Point, Size};
pub use diagram::{current_timestamp_ms, CellState, Diagram};
pub use error::{AuthzError, StoreError};
pub use history::{
    HistoryDirection, HistoryEntry, HistoryStep, OperationHistory, DEFAULT_HISTORY_CAPACITY,
};
pub use identity::{IdentityResolver, MemoryIdentityDirectory, Role, User};
pub use patch::{
    apply_patch, is_valid_cell_id, AppliedPatch, CellChange, CellOperation, CellOperationKind,
    CellPatch, PatchRejection, RejectReason,
};
pub use store::{DiagramStore, MemoryDiagramStore};

/// Collab core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
