//! Resync, sync status, undo and redo.

use collab_core::HistoryDirection;
use uuid::Uuid;

use super::Origin;
use crate::metrics::record_history_step;
use crate::protocol::ServerMessage;
use crate::session::Session;

impl Session {
    pub(crate) fn handle_resync(&mut self, origin: &Origin) {
        tracing::info!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            update_vector = self.history.update_vector(),
            "Resync requested"
        );
        let snapshot = self.snapshot_message();
        self.send_to(origin.connection_id, &snapshot);
    }

    pub(crate) fn handle_sync_status(&mut self, origin: &Origin) {
        let status = ServerMessage::SyncStatusResponse {
            update_vector: self.history.update_vector(),
        };
        self.send_to(origin.connection_id, &status);
    }

    /// Send the full state unless the client already holds the current vector.
    pub(crate) fn handle_sync_request(&mut self, origin: &Origin, client_vector: Option<u64>) {
        let current = self.history.update_vector();
        if client_vector == Some(current) {
            self.handle_sync_status(origin);
        } else {
            tracing::debug!(
                session_id = %self.id,
                client_vector = ?client_vector,
                current,
                "Client behind, sending state"
            );
            self.handle_resync(origin);
        }
    }

    pub(crate) async fn handle_undo(&mut self, origin: &Origin) {
        self.history_step(origin, HistoryDirection::Undo).await;
    }

    pub(crate) async fn handle_redo(&mut self, origin: &Origin) {
        self.history_step(origin, HistoryDirection::Redo).await;
    }

    /// Undo and redo are ordinary changes: they take the next sequence
    /// number, are persisted, and are broadcast to every participant
    /// including the requester.
    async fn history_step(&mut self, origin: &Origin, direction: HistoryDirection) {
        let operation_type = direction.as_str();
        if let Err(denied) = self.check_mutation_permission(&origin.user).await {
            self.send_to(
                origin.connection_id,
                &ServerMessage::AuthorizationDenied {
                    original_operation_id: operation_type.to_string(),
                    reason: denied.reason().to_string(),
                },
            );
            return;
        }

        let step = match direction {
            HistoryDirection::Undo => self.history.prepare_undo(),
            HistoryDirection::Redo => self.history.prepare_redo(),
        };
        let Some(step) = step else {
            record_history_step(operation_type, false);
            self.send_to(
                origin.connection_id,
                &ServerMessage::HistoryOperation {
                    operation_type: operation_type.to_string(),
                    message: format!("no_operations_to_{operation_type}"),
                },
            );
            return;
        };

        let persisted = match self.pending_sequence() {
            Ok(pending) => self.persist(&step.state, pending).await,
            Err(rejection) => Err(rejection),
        };
        if let Err(rejection) = persisted {
            self.send_error(
                origin.connection_id,
                rejection.reason.as_str(),
                format!("Unable to {operation_type}: {}", rejection.message),
            );
            return;
        }

        let sequence_number = self.assign_sequence_number();
        let patch = step.patch.clone();
        let reverted = step.operation_id.clone();
        self.history.commit_step(sequence_number, step);
        record_history_step(operation_type, true);

        tracing::info!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            direction = operation_type,
            target_operation = %reverted,
            sequence_number,
            "History step applied"
        );
        let event = ServerMessage::DiagramOperationEvent {
            initiating_user: origin.user.clone(),
            operation_id: format!("{operation_type}-{}", Uuid::new_v4()),
            sequence_number,
            update_vector: sequence_number,
            operation: patch,
        };
        self.broadcast(&event, None);
    }
}

#[cfg(test)]
mod tests {
    use crate::session::test_support::*;
    use collab_core::{Diagram, DiagramStore, Node, NodeShape, Role};
    use serde_json::json;

    fn diagram() -> Diagram {
        Diagram::new("d1", "Flows").with_cells(vec![Node::new("n1", NodeShape::Process).into()])
    }

    fn add(id: &str) -> serde_json::Value {
        json!({
            "message_type": "diagram_operation_request",
            "operation_id": format!("add-{id}"),
            "operation": {"type": "patch", "cells": [
                {"id": id, "operation": "add", "data": {"id": id, "shape": "store"}}
            ]}
        })
    }

    #[tokio::test]
    async fn test_undo_with_empty_history() {
        let fixture = Fixture::new(diagram());
        let session = fixture.spawn("d1", "", &alice()).await;
        let mut a = TestClient::join(&session, &alice()).await;
        a.drain();

        a.send(&session, json!({"message_type": "undo_request"})).await;
        let reply = a.recv_type("history_operation").await;
        assert_eq!(reply["operation_type"], "undo");
        assert_eq!(reply["message"], "no_operations_to_undo");

        a.send(&session, json!({"message_type": "redo_request"})).await;
        let reply = a.recv_type("history_operation").await;
        assert_eq!(reply["message"], "no_operations_to_redo");
    }

    #[tokio::test]
    async fn test_undo_redo_broadcast_to_everyone() {
        let fixture = Fixture::new(diagram());
        let session = fixture.spawn("d1", "", &alice()).await;
        let mut a = TestClient::join(&session, &alice()).await;
        let mut b = TestClient::join(&session, &bob()).await;

        a.send(&session, add("n2")).await;
        settle(&session).await;
        a.drain();
        b.drain();

        a.send(&session, json!({"message_type": "undo_request"})).await;
        let own = a.recv_type("diagram_operation_event").await;
        let other = b.recv_type("diagram_operation_event").await;
        assert_eq!(own["sequence_number"], 2);
        assert_eq!(other["sequence_number"], 2);
        assert_eq!(other["operation"]["cells"][0]["operation"], "remove");
        assert_eq!(fixture.store.get("d1").await.expect("stored").cells.len(), 1);

        b.send(&session, json!({"message_type": "redo_request"})).await;
        let redo = a.recv_type("diagram_operation_event").await;
        assert_eq!(redo["sequence_number"], 3);
        assert_eq!(redo["initiating_user"]["provider_id"], "bob-id");
        assert_eq!(redo["operation"]["cells"][0]["operation"], "add");
        assert_eq!(fixture.store.get("d1").await.expect("stored").update_vector, 3);
    }

    #[tokio::test]
    async fn test_reader_cannot_undo() {
        let fixture = Fixture::new(diagram().in_threat_model("tm1"));
        fixture.authz.grant("tm1", "alice-id", Role::Writer);
        fixture.authz.grant("tm1", "bob-id", Role::Reader);
        let session = fixture.spawn("d1", "tm1", &alice()).await;
        let a = TestClient::join(&session, &alice()).await;
        let mut b = TestClient::join(&session, &bob()).await;
        a.send(&session, add("n2")).await;
        settle(&session).await;
        b.drain();

        b.send(&session, json!({"message_type": "undo_request"})).await;
        let denied = b.recv_type("authorization_denied").await;
        assert_eq!(denied["original_operation_id"], "undo");
        assert_eq!(session.info().update_vector, 1);
    }

    #[tokio::test]
    async fn test_resync_and_sync_status() {
        let fixture = Fixture::new(diagram());
        let session = fixture.spawn("d1", "", &alice()).await;
        let mut a = TestClient::join(&session, &alice()).await;
        a.send(&session, add("n2")).await;
        settle(&session).await;
        a.drain();

        a.send(&session, json!({"message_type": "resync_request"})).await;
        let state = a.recv_type("diagram_state").await;
        assert_eq!(state["update_vector"], 1);
        assert_eq!(state["cells"].as_array().map(Vec::len), Some(2));

        a.send(&session, json!({"message_type": "sync_status_request"}))
            .await;
        let status = a.recv_type("sync_status_response").await;
        assert_eq!(status["update_vector"], 1);

        a.send(&session, json!({"message_type": "sync_request", "update_vector": 1}))
            .await;
        let current = a.next_json().await;
        assert_eq!(current["message_type"], "sync_status_response");

        a.send(&session, json!({"message_type": "sync_request", "update_vector": 0}))
            .await;
        let behind = a.next_json().await;
        assert_eq!(behind["message_type"], "diagram_state");
    }
}
