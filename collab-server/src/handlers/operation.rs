//! `diagram_operation_request`: validate, persist, record, broadcast.

use collab_core::{current_timestamp_ms, CellPatch, PatchRejection, RejectReason};

use super::Origin;
use crate::metrics::{record_operation, record_validation_failure};
use crate::protocol::ServerMessage;
use crate::session::Session;
use crate::validation::validate_operation_id;

impl Session {
    /// Apply a client patch.
    ///
    /// A sequence number is consumed only once the change is persisted, so
    /// accepted operations carry consecutive numbers and rejections carry none.
    /// The event goes to every other participant; the sender already applied
    /// the change locally.
    pub(crate) async fn handle_diagram_operation(
        &mut self,
        origin: &Origin,
        operation_id: String,
        base_vector: Option<u64>,
        patch: &CellPatch,
    ) {
        if let Err(denied) = self.check_mutation_permission(&origin.user).await {
            tracing::warn!(
                session_id = %self.id,
                user_id = %origin.user.user_id(),
                operation_id = %operation_id,
                reason = denied.reason(),
                "Operation refused"
            );
            record_operation("unauthorized", denied.reason());
            self.send_to(
                origin.connection_id,
                &ServerMessage::AuthorizationDenied {
                    original_operation_id: operation_id,
                    reason: denied.reason().to_string(),
                },
            );
            return;
        }

        if let Err(e) = validate_operation_id(&operation_id) {
            record_validation_failure("operation_id");
            let rejection = PatchRejection::new(RejectReason::ValidationFailed, e.to_string());
            self.reject(origin, operation_id, rejection);
            return;
        }

        let applied = match self.history.prepare(patch, base_vector) {
            Ok(applied) => applied,
            Err(rejection) => {
                self.reject(origin, operation_id, rejection);
                return;
            }
        };

        let pending = match self.pending_sequence() {
            Ok(pending) => pending,
            Err(rejection) => {
                self.reject(origin, operation_id, rejection);
                return;
            }
        };
        if let Err(rejection) = self.persist(&applied.state, pending).await {
            self.reject(origin, operation_id, rejection);
            return;
        }

        let sequence_number = self.assign_sequence_number();
        let cells_modified = applied.cells_modified();
        let entry = self
            .history
            .commit(sequence_number, &operation_id, origin.user.user_id(), applied);
        let event = ServerMessage::DiagramOperationEvent {
            initiating_user: origin.user.clone(),
            operation_id,
            sequence_number,
            update_vector: sequence_number,
            operation: entry.patch.clone(),
        };

        tracing::info!(
            session_id = %self.id,
            diagram_id = %self.diagram_id,
            user_id = %origin.user.user_id(),
            sequence_number,
            cells = ?cells_modified,
            "Operation applied"
        );
        record_operation("accepted", "");
        self.broadcast(&event, Some(origin.connection_id));
    }

    fn reject(&mut self, origin: &Origin, operation_id: String, rejection: PatchRejection) {
        tracing::info!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            operation_id = %operation_id,
            reason = rejection.reason.as_str(),
            affected = ?rejection.affected_cells,
            "Operation rejected"
        );
        record_operation("rejected", rejection.reason.as_str());
        let requires_resync = rejection.requires_resync();
        let message = ServerMessage::OperationRejected {
            operation_id,
            sequence_number: None,
            update_vector: self.history.update_vector(),
            reason: rejection.reason,
            message: rejection.message,
            details: rejection.details,
            affected_cells: rejection.affected_cells,
            requires_resync,
            timestamp: current_timestamp_ms(),
        };
        self.send_to(origin.connection_id, &message);
    }
}
