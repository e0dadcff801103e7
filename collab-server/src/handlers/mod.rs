//! Per-message-type handlers, run inside the session task.
//!
//! [`Session::dispatch`] is the dispatch table: one arm per client message
//! type, each delegating to a handler in this module tree.

mod history;
mod operation;
mod presenter;

use collab_core::{CellState, PatchRejection, RejectReason, User};

use crate::protocol::ClientMessage;
use crate::session::{ConnectionId, Session};

/// Sender of the message being handled.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub(crate) connection_id: ConnectionId,
    pub(crate) user: User,
}

/// Why a mutation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PermissionDenied {
    Anonymous,
    Unscoped,
    InsufficientRole,
    Unavailable,
}

impl PermissionDenied {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous_user",
            Self::Unscoped => "diagram_not_in_threat_model",
            Self::InsufficientRole => "insufficient_permissions",
            Self::Unavailable => "authorization_unavailable",
        }
    }
}

impl Session {
    pub(crate) async fn dispatch(&mut self, origin: Origin, message: ClientMessage) {
        match message {
            ClientMessage::DiagramOperationRequest {
                operation_id,
                base_vector,
                operation,
            } => {
                self.handle_diagram_operation(&origin, operation_id, base_vector, &operation)
                    .await;
            }
            ClientMessage::PresenterRequest => self.handle_presenter_request(&origin),
            ClientMessage::ChangePresenterRequest { new_presenter } => {
                self.handle_change_presenter(&origin, &new_presenter);
            }
            ClientMessage::RemoveParticipantRequest { removed_user } => {
                self.handle_remove_participant(&origin, &removed_user).await;
            }
            ClientMessage::PresenterDeniedRequest { denied_user } => {
                self.handle_presenter_denied(&origin, &denied_user);
            }
            ClientMessage::PresenterCursor { cursor_position } => {
                self.handle_presenter_cursor(&origin, cursor_position);
            }
            ClientMessage::PresenterSelection { selected_cells } => {
                self.handle_presenter_selection(&origin, selected_cells);
            }
            ClientMessage::ResyncRequest => self.handle_resync(&origin),
            ClientMessage::UndoRequest => self.handle_undo(&origin).await,
            ClientMessage::RedoRequest => self.handle_redo(&origin).await,
            ClientMessage::SyncStatusRequest => self.handle_sync_status(&origin),
            ClientMessage::SyncRequest { update_vector } => {
                self.handle_sync_request(&origin, update_vector);
            }
        }
    }

    /// Whether `user` may change the diagram.
    ///
    /// Diagrams outside any threat model are writable only when the server
    /// allows unscoped mutations.
    pub(crate) async fn check_mutation_permission(
        &self,
        user: &User,
    ) -> Result<(), PermissionDenied> {
        if user.is_anonymous() {
            return Err(PermissionDenied::Anonymous);
        }
        if self.threat_model_id.is_empty() {
            return if self.config.allow_unscoped_mutations {
                Ok(())
            } else {
                Err(PermissionDenied::Unscoped)
            };
        }
        match self
            .collaborators
            .authz
            .role_for(user, &self.threat_model_id)
            .await
        {
            Ok(Some(role)) if role.can_mutate() => Ok(()),
            Ok(_) => Err(PermissionDenied::InsufficientRole),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    user_id = %user.user_id(),
                    error = %e,
                    "Authorization lookup failed"
                );
                Err(PermissionDenied::Unavailable)
            }
        }
    }

    /// Write `state` to the store as of `update_vector`.
    ///
    /// The session's copy of the diagram record only advances once the store
    /// accepted the write.
    pub(crate) async fn persist(
        &mut self,
        state: &CellState,
        update_vector: u64,
    ) -> Result<(), PatchRejection> {
        let updated = self.diagram.with_state(state, update_vector);
        match self
            .collaborators
            .store
            .update(&self.diagram_id, updated.clone())
            .await
        {
            Ok(()) => {
                self.diagram = updated;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(session_id = %self.id, diagram_id = %self.diagram_id, "Diagram disappeared from store");
                Err(PatchRejection::new(
                    RejectReason::DiagramNotFound,
                    "Diagram no longer exists",
                ))
            }
            Err(e) => {
                tracing::error!(
                    session_id = %self.id,
                    diagram_id = %self.diagram_id,
                    error = %e,
                    "Failed to save diagram"
                );
                Err(PatchRejection::new(RejectReason::SaveFailed, "Failed to save diagram")
                    .with_details(e.to_string()))
            }
        }
    }
}
