//! # Collaboration Wire Protocol
//!
//! Every frame is a JSON object tagged by `message_type`.
//!
//! ## Client -> Server
//!
//! - `{"message_type": "diagram_operation_request", "operation_id": "...", "base_vector": 3, "operation": {"type": "patch", "cells": [...]}}`
//! - `{"message_type": "presenter_request"}`
//! - `{"message_type": "change_presenter_request", "new_presenter": {...}}`
//! - `{"message_type": "remove_participant_request", "removed_user": {...}}`
//! - `{"message_type": "presenter_denied_request", "denied_user": {...}}`
//! - `{"message_type": "presenter_cursor", "cursor_position": {"x": 1.0, "y": 2.0}}`
//! - `{"message_type": "presenter_selection", "selected_cells": ["..."]}`
//! - `{"message_type": "resync_request"}`
//! - `{"message_type": "undo_request"}` / `{"message_type": "redo_request"}`
//! - `{"message_type": "sync_status_request"}`
//! - `{"message_type": "sync_request", "update_vector": 3}`
//!
//! ## Server -> Client
//!
//! - `diagram_state`, `diagram_operation_event`, `operation_rejected`
//! - `participants_update`, `presenter_request_event`, `presenter_denied_event`
//! - `presenter_cursor`, `presenter_selection` (relayed from the presenter)
//! - `authorization_denied`, `history_operation`, `sync_status_response`, `error`

use collab_core::{current_timestamp_ms, Cell, CellPatch, RejectReason, Role, User};
use serde::{Deserialize, Serialize};

/// Types clients may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "diagram_operation_request",
    "presenter_request",
    "change_presenter_request",
    "remove_participant_request",
    "presenter_denied_request",
    "presenter_cursor",
    "presenter_selection",
    "resync_request",
    "undo_request",
    "redo_request",
    "sync_status_request",
    "sync_request",
];

/// Request types superseded by `_request`/`_event` pairs.
pub const DEPRECATED_MESSAGE_TYPES: &[&str] =
    &["diagram_operation", "change_presenter", "remove_participant"];

/// Types only the server may send.
pub const SERVER_ONLY_MESSAGE_TYPES: &[&str] = &[
    "diagram_state",
    "diagram_operation_event",
    "operation_rejected",
    "participants_update",
    "presenter_request_event",
    "presenter_denied_event",
    "authorization_denied",
    "history_operation",
    "sync_status_response",
    "error",
];

/// Cursor position in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// Client-to-server WebSocket message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Apply a cell patch to the diagram.
    DiagramOperationRequest {
        /// Client-generated operation id, echoed in events and rejections.
        operation_id: String,
        /// Update vector the client's view is based on.
        #[serde(default)]
        base_vector: Option<u64>,
        /// The patch.
        operation: CellPatch,
    },
    /// Ask to become presenter.
    PresenterRequest,
    /// Host assigns the presenter.
    ChangePresenterRequest {
        /// Who should present.
        new_presenter: User,
    },
    /// Host removes a participant and bars them from rejoining.
    RemoveParticipantRequest {
        /// Who to remove.
        removed_user: User,
    },
    /// Host turns down a presenter request.
    PresenterDeniedRequest {
        /// Whose request is denied.
        denied_user: User,
    },
    /// Presenter cursor movement.
    PresenterCursor {
        /// New cursor position.
        cursor_position: CursorPosition,
    },
    /// Presenter selection change.
    PresenterSelection {
        /// Selected cell ids.
        selected_cells: Vec<String>,
    },
    /// Ask for the full current state.
    ResyncRequest,
    /// Revert the most recent operation.
    UndoRequest,
    /// Re-apply the most recently undone operation.
    RedoRequest,
    /// Ask for the current update vector.
    SyncStatusRequest,
    /// Ask for the full state unless the client is already current.
    SyncRequest {
        /// Update vector the client holds.
        #[serde(default)]
        update_vector: Option<u64>,
    },
}

impl ClientMessage {
    /// Wire name of the message type.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::DiagramOperationRequest { .. } => "diagram_operation_request",
            Self::PresenterRequest => "presenter_request",
            Self::ChangePresenterRequest { .. } => "change_presenter_request",
            Self::RemoveParticipantRequest { .. } => "remove_participant_request",
            Self::PresenterDeniedRequest { .. } => "presenter_denied_request",
            Self::PresenterCursor { .. } => "presenter_cursor",
            Self::PresenterSelection { .. } => "presenter_selection",
            Self::ResyncRequest => "resync_request",
            Self::UndoRequest => "undo_request",
            Self::RedoRequest => "redo_request",
            Self::SyncStatusRequest => "sync_status_request",
            Self::SyncRequest { .. } => "sync_request",
        }
    }
}

/// One entry of a participants list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    /// The participant.
    pub user: User,
    /// Role on the diagram's threat model.
    pub permissions: Role,
    /// Last message time (ms since epoch).
    pub last_activity: u64,
}

/// Server-to-client WebSocket message types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full diagram state, sent on join and on resync.
    DiagramState {
        /// Diagram id.
        diagram_id: String,
        /// Sequence number of the last applied change.
        update_vector: u64,
        /// All cells in diagram order.
        cells: Vec<Cell>,
    },
    /// An accepted operation.
    DiagramOperationEvent {
        /// Authenticated sender.
        initiating_user: User,
        /// Operation id.
        operation_id: String,
        /// Sequence number assigned to the operation.
        sequence_number: u64,
        /// Update vector after the operation.
        update_vector: u64,
        /// The effective patch.
        operation: CellPatch,
    },
    /// An operation that was not applied.
    OperationRejected {
        /// Operation id from the request.
        operation_id: String,
        /// Never assigned for rejected operations.
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        /// Current update vector.
        update_vector: u64,
        /// Machine-readable reason.
        reason: RejectReason,
        /// Human-readable message.
        message: String,
        /// Diagnostic details.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        /// Cells the rejection concerns.
        affected_cells: Vec<String>,
        /// Whether the client must resync before retrying.
        requires_resync: bool,
        /// Rejection timestamp.
        timestamp: u64,
    },
    /// Current participants, host and presenter.
    ParticipantsUpdate {
        /// Connected participants.
        participants: Vec<Participant>,
        /// Session host.
        host: User,
        /// Current presenter.
        current_presenter: Option<User>,
    },
    /// Sent to the host when someone asks to present.
    PresenterRequestEvent {
        /// Who asked.
        requesting_user: User,
    },
    /// Sent to a participant whose presenter request was denied.
    PresenterDeniedEvent {
        /// The denied participant.
        denied_user: User,
    },
    /// Presenter cursor, relayed.
    PresenterCursor {
        /// Cursor position.
        cursor_position: CursorPosition,
    },
    /// Presenter selection, relayed.
    PresenterSelection {
        /// Selected cell ids.
        selected_cells: Vec<String>,
    },
    /// A mutation was refused for lack of permission.
    AuthorizationDenied {
        /// The refused operation.
        original_operation_id: String,
        /// Why.
        reason: String,
    },
    /// Outcome of an undo or redo that did not produce an event.
    HistoryOperation {
        /// `undo` or `redo`.
        operation_type: String,
        /// Outcome, e.g. `no_operations_to_undo`.
        message: String,
    },
    /// Current update vector.
    SyncStatusResponse {
        /// Sequence number of the last applied change.
        update_vector: u64,
    },
    /// Protocol, control or internal failure.
    Error {
        /// Machine-readable code.
        error: String,
        /// Human-readable message.
        message: String,
        /// Diagnostic details.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        /// Error timestamp.
        timestamp: u64,
    },
}

impl ServerMessage {
    /// Build an error frame.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            error: code.to_string(),
            message: message.into(),
            details: None,
            timestamp: current_timestamp_ms(),
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::DiagramState { .. } => "diagram_state",
            Self::DiagramOperationEvent { .. } => "diagram_operation_event",
            Self::OperationRejected { .. } => "operation_rejected",
            Self::ParticipantsUpdate { .. } => "participants_update",
            Self::PresenterRequestEvent { .. } => "presenter_request_event",
            Self::PresenterDeniedEvent { .. } => "presenter_denied_event",
            Self::PresenterCursor { .. } => "presenter_cursor",
            Self::PresenterSelection { .. } => "presenter_selection",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::HistoryOperation { .. } => "history_operation",
            Self::SyncStatusResponse { .. } => "sync_status_response",
            Self::Error { .. } => "error",
        }
    }
}

/// Error codes sent in `error` frames.
pub mod codes {
    /// Non-host attempted a host-only action.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// Request is well-formed but not allowed in the current state.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Frame is not valid JSON or its payload does not match its type.
    pub const INVALID_MESSAGE: &str = "invalid_message";
    /// Client sent a server-only type.
    pub const INVALID_MESSAGE_TYPE: &str = "invalid_message_type";
    /// Unknown type.
    pub const UNSUPPORTED_MESSAGE_TYPE: &str = "unsupported_message_type";
    /// Superseded type.
    pub const DEPRECATED_MESSAGE_TYPE: &str = "deprecated_message_type";
    /// Payload failed validation.
    pub const VALIDATION_FAILED: &str = "validation_failed";
    /// Join refused.
    pub const ACCESS_DENIED: &str = "access_denied";
    /// Session stopped while the join was in flight.
    pub const SESSION_CLOSED: &str = "session_closed";
    /// Connection exceeded its message rate.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Frame exceeded the size limit.
    pub const MESSAGE_TOO_LARGE: &str = "message_too_large";
    /// A handler failed unexpectedly.
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operation_request() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "message_type": "diagram_operation_request",
            "operation_id": "op-1",
            "operation": {"type": "patch", "cells": [{"id": "c1", "operation": "remove"}]}
        }))
        .expect("should parse");
        match msg {
            ClientMessage::DiagramOperationRequest {
                operation_id,
                base_vector,
                operation,
            } => {
                assert_eq!(operation_id, "op-1");
                assert_eq!(base_vector, None);
                assert_eq!(operation.cells.len(), 1);
            }
            _ => panic!("Expected DiagramOperationRequest"),
        }
    }

    #[test]
    fn test_unit_request_ignores_extra_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "message_type": "undo_request",
            "initiating_user": {"provider_id": "x"}
        }))
        .expect("should parse");
        assert!(matches!(msg, ClientMessage::UndoRequest));
        assert_eq!(msg.message_type(), "undo_request");
    }

    #[test]
    fn test_user_fields_default_to_empty() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "message_type": "remove_participant_request",
            "removed_user": {"email": "bob@example.com"}
        }))
        .expect("should parse");
        match msg {
            ClientMessage::RemoveParticipantRequest { removed_user } => {
                assert!(removed_user.provider_id.is_empty());
                assert_eq!(removed_user.email, "bob@example.com");
            }
            _ => panic!("Expected RemoveParticipantRequest"),
        }
    }

    #[test]
    fn test_serialize_rejection() {
        let msg = ServerMessage::OperationRejected {
            operation_id: "op-2".to_string(),
            sequence_number: None,
            update_vector: 4,
            reason: RejectReason::ConflictDetected,
            message: "Conflict detected on cells: c1".to_string(),
            details: None,
            affected_cells: vec!["c1".to_string()],
            requires_resync: true,
            timestamp: 1,
        };
        let json = serde_json::to_value(&msg).expect("should serialize");
        assert_eq!(json["message_type"], "operation_rejected");
        assert_eq!(json["reason"], "conflict_detected");
        assert_eq!(json["requires_resync"], true);
        assert!(json.get("sequence_number").is_none());
        assert_eq!(msg.message_type(), "operation_rejected");
    }

    #[test]
    fn test_serialize_participants_update() {
        let host = User::new("alice");
        let msg = ServerMessage::ParticipantsUpdate {
            participants: vec![Participant {
                user: host.clone(),
                permissions: Role::Owner,
                last_activity: 10,
            }],
            host: host.clone(),
            current_presenter: Some(host),
        };
        let json = serde_json::to_value(&msg).expect("should serialize");
        assert_eq!(json["participants"][0]["permissions"], "owner");
        assert_eq!(json["current_presenter"]["provider_id"], "alice");
    }

    #[test]
    fn test_error_frame_shape() {
        let json = serde_json::to_value(ServerMessage::error(codes::UNAUTHORIZED, "nope"))
            .expect("should serialize");
        assert_eq!(json["message_type"], "error");
        assert_eq!(json["error"], "unauthorized");
        assert!(json["timestamp"].as_u64().is_some());
    }

    #[test]
    fn test_server_only_list_matches_serializer() {
        let samples = [
            ServerMessage::SyncStatusResponse { update_vector: 0 },
            ServerMessage::error(codes::INTERNAL_ERROR, "x"),
            ServerMessage::HistoryOperation {
                operation_type: "undo".to_string(),
                message: "no_operations_to_undo".to_string(),
            },
        ];
        for sample in samples {
            assert!(SERVER_ONLY_MESSAGE_TYPES.contains(&sample.message_type()));
        }
    }
}
