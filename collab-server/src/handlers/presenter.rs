//! Host and presenter control.
//!
//! The host is whoever opened the session. Only the host may assign the
//! presenter, deny presenter requests or remove participants. Cursor and
//! selection updates are relayed only when they come from the presenter.

use axum::extract::ws::close_code;
use collab_core::User;

use super::Origin;
use crate::metrics::record_validation_failure;
use crate::protocol::{codes, CursorPosition, ServerMessage};
use crate::session::Session;
use crate::validation::{validate_cursor, validate_selection};

impl Session {
    pub(crate) fn handle_presenter_request(&mut self, origin: &Origin) {
        if self.is_presenter(&origin.user) {
            tracing::debug!(session_id = %self.id, user_id = %origin.user.user_id(), "Already presenting");
            return;
        }

        if self.is_host(&origin.user) {
            tracing::info!(session_id = %self.id, "Host took over presenting");
            self.presenter = Some(self.host.clone());
            let update = self.participants_message();
            self.broadcast(&update, None);
            return;
        }

        let host_id = self.host.user_id().to_string();
        if self.connections_of(&host_id).is_empty() {
            self.send_error(
                origin.connection_id,
                codes::INVALID_REQUEST,
                "The host is not connected",
            );
            return;
        }

        tracing::info!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            "Presenter requested"
        );
        self.send_to_user(
            &host_id,
            &ServerMessage::PresenterRequestEvent {
                requesting_user: origin.user.clone(),
            },
        );
    }

    pub(crate) fn handle_change_presenter(&mut self, origin: &Origin, claim: &User) {
        if !self.require_host(origin, "change the presenter") {
            return;
        }
        let Some(target) = self.resolve_connected_target(origin, claim) else {
            return;
        };

        tracing::info!(
            session_id = %self.id,
            presenter = %target.user_id(),
            "Presenter changed"
        );
        self.presenter = Some(target);
        let update = self.participants_message();
        self.broadcast(&update, None);
    }

    pub(crate) fn handle_presenter_denied(&mut self, origin: &Origin, claim: &User) {
        if !self.require_host(origin, "deny presenter requests") {
            return;
        }
        let Some(target) = self.resolve_connected_target(origin, claim) else {
            return;
        };

        tracing::info!(session_id = %self.id, user_id = %target.user_id(), "Presenter request denied");
        let target_id = target.user_id().to_string();
        self.send_to_user(
            &target_id,
            &ServerMessage::PresenterDeniedEvent {
                denied_user: target,
            },
        );
    }

    /// Remove a participant and bar them from rejoining.
    ///
    /// The target may already be disconnected; it is then resolved through
    /// the identity directory by email.
    pub(crate) async fn handle_remove_participant(&mut self, origin: &Origin, claim: &User) {
        if !self.require_host(origin, "remove participants") {
            return;
        }

        let target_id = if let Some(connected) = self.find_connected(claim) {
            if !connected.satisfies(claim) {
                self.identity_mismatch(origin, claim);
                return;
            }
            connected.user_id().to_string()
        } else if !claim.provider_id.is_empty() {
            claim.provider_id.clone()
        } else if !claim.email.is_empty() {
            match self.collaborators.identities.resolve_email(&claim.email).await {
                Ok(Some(user)) => user.user_id().to_string(),
                Ok(None) => {
                    self.send_error(origin.connection_id, codes::INVALID_REQUEST, "Unknown user");
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Identity lookup failed");
                    self.send_error(
                        origin.connection_id,
                        codes::INVALID_REQUEST,
                        "Unable to resolve user",
                    );
                    return;
                }
            }
        } else {
            self.send_error(
                origin.connection_id,
                codes::INVALID_REQUEST,
                "Target user must carry a provider_id or email",
            );
            return;
        };

        if target_id == self.host.user_id() {
            self.send_error(
                origin.connection_id,
                codes::INVALID_REQUEST,
                "The host cannot remove themselves",
            );
            return;
        }

        let connected = !self.connections_of(&target_id).is_empty();
        if !connected && !self.denied.contains(&target_id) {
            self.send_error(
                origin.connection_id,
                codes::INVALID_REQUEST,
                "User is not a participant in this session",
            );
            return;
        }

        self.denied.insert(target_id.clone());
        self.disconnect_user(&target_id, close_code::POLICY, "removed from session");
        if self
            .presenter
            .as_ref()
            .is_some_and(|p| p.user_id() == target_id)
        {
            self.presenter = Some(self.host.clone());
        }

        tracing::info!(
            session_id = %self.id,
            removed = %target_id,
            was_connected = connected,
            "Participant removed"
        );
        if !self.clients.is_empty() {
            let update = self.participants_message();
            self.broadcast(&update, None);
        }
    }

    pub(crate) fn handle_presenter_cursor(&mut self, origin: &Origin, position: CursorPosition) {
        if !self.is_presenter(&origin.user) {
            tracing::debug!(session_id = %self.id, user_id = %origin.user.user_id(), "Cursor from non-presenter dropped");
            return;
        }
        if let Err(e) = validate_cursor(position.x, position.y) {
            record_validation_failure("cursor");
            self.send_error(origin.connection_id, codes::VALIDATION_FAILED, e.to_string());
            return;
        }
        self.broadcast(
            &ServerMessage::PresenterCursor {
                cursor_position: position,
            },
            Some(origin.connection_id),
        );
    }

    pub(crate) fn handle_presenter_selection(&mut self, origin: &Origin, selected: Vec<String>) {
        if !self.is_presenter(&origin.user) {
            tracing::debug!(session_id = %self.id, user_id = %origin.user.user_id(), "Selection from non-presenter dropped");
            return;
        }
        if let Err(e) = validate_selection(&selected) {
            record_validation_failure("selection");
            self.send_error(origin.connection_id, codes::VALIDATION_FAILED, e.to_string());
            return;
        }
        self.broadcast(
            &ServerMessage::PresenterSelection {
                selected_cells: selected,
            },
            Some(origin.connection_id),
        );
    }

    fn require_host(&mut self, origin: &Origin, action: &str) -> bool {
        if self.is_host(&origin.user) {
            return true;
        }
        tracing::warn!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            action,
            "Host-only action attempted by participant"
        );
        self.send_error(
            origin.connection_id,
            codes::UNAUTHORIZED,
            format!("Only the host can {action}"),
        );
        false
    }

    /// Find the connected user a host command names, checking every
    /// identity field the command supplied.
    fn resolve_connected_target(&mut self, origin: &Origin, claim: &User) -> Option<User> {
        let Some(target) = self.find_connected(claim) else {
            self.send_error(
                origin.connection_id,
                codes::INVALID_REQUEST,
                "Target user is not connected",
            );
            return None;
        };
        if !target.satisfies(claim) {
            self.identity_mismatch(origin, claim);
            return None;
        }
        Some(target)
    }

    fn identity_mismatch(&mut self, origin: &Origin, claim: &User) {
        tracing::warn!(
            session_id = %self.id,
            user_id = %origin.user.user_id(),
            claimed = %claim,
            "Target identity does not match connected user"
        );
        self.send_error(
            origin.connection_id,
            codes::INVALID_REQUEST,
            "Target user identity does not match",
        );
    }
}
