//! # Diagram Sessions
//!
//! Each live diagram is owned by one session task. The task holds the
//! authoritative cell state, the operation history, the participant set and
//! the host/presenter roles, and is the only code that touches them. Other
//! tasks talk to it through a [`SessionHandle`], which queues
//! [`SessionCommand`]s and exposes a read-only [`SessionInfo`] snapshot.
//!
//! ```text
//! read pump ──Inbound──▶ ┌──────────────┐ ──Outbound──▶ write pump (client A)
//! read pump ──Inbound──▶ │ session task │ ──Outbound──▶ write pump (client B)
//! hub ───Register/Reap─▶ └──────────────┘
//! ```
//!
//! Outbound frames are serialized once and pushed onto each client's bounded
//! queue without waiting. A client whose queue is full is dropped from the
//! session rather than slowing everyone else down.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, Utf8Bytes};
use collab_core::{
    current_timestamp_ms, AuthorizationService, Diagram, DiagramStore, IdentityResolver,
    OperationHistory, PatchRejection, RejectReason, Role, User, DEFAULT_HISTORY_CAPACITY,
};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::handlers::Origin;
use crate::metrics::{
    record_handler_panic, record_slow_client_dropped, record_validation_failure,
    record_ws_message,
};
use crate::protocol::{codes, Participant, ServerMessage};
use crate::router;

/// Capacity of a session's command queue.
pub const SESSION_COMMAND_BUFFER: usize = 1024;
/// Default capacity of a client's outbound queue.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Identifies one WebSocket connection. A user may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A frame queued for a client's write pump.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialized JSON text frame.
    Text(Utf8Bytes),
    /// Close the connection with this code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: &'static str,
    },
}

/// A connection joining a session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Authenticated user.
    pub user: User,
    /// Role resolved when the connection was accepted.
    pub role: Role,
    /// Outbound queue drained by the connection's write pump.
    pub sender: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    /// Wrap a new connection.
    #[must_use]
    pub fn new(user: User, role: Role, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            user,
            role,
            sender,
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// At least one participant, or freshly created.
    Active,
    /// No participants; waiting out the grace period.
    Closing,
    /// Task has stopped.
    Closed,
}

/// Read-only view of a session, refreshed after every command.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub session_id: String,
    /// Diagram being edited.
    pub diagram_id: String,
    /// Owning threat model, empty when unscoped.
    pub threat_model_id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Connected clients.
    pub participant_count: usize,
    /// Session host.
    pub host: User,
    /// Current presenter.
    pub current_presenter: Option<User>,
    /// Sequence number of the last applied change.
    pub update_vector: u64,
    /// Entries in the operation history.
    pub history_len: usize,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    /// Last client activity (ms since epoch).
    pub last_activity: u64,
    /// When the session last became empty.
    #[serde(skip)]
    pub idle_since: Option<Instant>,
}

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinRejection {
    /// The host removed this user from the session.
    #[error("you were removed from this session")]
    Denied,
    /// The connection carries no canonical user id.
    #[error("anonymous users cannot join a session")]
    Anonymous,
    /// The session stopped before the join was processed.
    #[error("session has shut down")]
    Closed,
}

impl JoinRejection {
    /// Error code sent to the refused client.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Denied | Self::Anonymous => codes::ACCESS_DENIED,
            Self::Closed => codes::SESSION_CLOSED,
        }
    }
}

/// The session task has stopped.
#[derive(Debug, Clone, Copy, Error)]
#[error("session is closed")]
pub struct SessionClosed;

/// Commands accepted by a session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Add a connection.
    Register {
        /// The joining connection.
        client: ClientHandle,
        /// Join outcome.
        reply: oneshot::Sender<Result<(), JoinRejection>>,
    },
    /// Remove a connection.
    Unregister {
        /// The departing connection.
        connection_id: ConnectionId,
    },
    /// A text frame from a connection.
    Inbound {
        /// Sender.
        connection_id: ConnectionId,
        /// Raw frame.
        payload: String,
    },
    /// Send a message to every client, optionally skipping one.
    Broadcast {
        /// Message.
        message: ServerMessage,
        /// Connection to skip.
        exclude: Option<ConnectionId>,
    },
    /// Stop if the session has been empty for at least `grace`.
    Reap {
        /// Required idle time.
        grace: Duration,
        /// Whether the session stopped.
        reply: oneshot::Sender<bool>,
    },
    /// Stop unconditionally.
    Shutdown,
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Log entries kept for undo.
    pub history_capacity: usize,
    /// Whether writes are allowed on diagrams outside any threat model.
    pub allow_unscoped_mutations: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            allow_unscoped_mutations: true,
        }
    }
}

/// External services a session depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Diagram persistence.
    pub store: Arc<dyn DiagramStore>,
    /// Role lookup.
    pub authz: Arc<dyn AuthorizationService>,
    /// Email to user lookup for removing disconnected users.
    pub identities: Arc<dyn IdentityResolver>,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    info: Arc<RwLock<SessionInfo>>,
}

impl SessionHandle {
    /// Start a session task for `diagram`, hosted by `host`.
    #[must_use]
    pub fn spawn(
        diagram: Diagram,
        threat_model_id: &str,
        host: User,
        collaborators: Collaborators,
        config: SessionConfig,
    ) -> Self {
        let session = Session::new(diagram, threat_model_id, host, collaborators, config);
        let info = Arc::clone(&session.info);
        let (commands, receiver) = mpsc::channel(SESSION_COMMAND_BUFFER);
        tokio::spawn(session.run(receiver));
        Self { commands, info }
    }

    /// Add a connection to the session.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinRejection`] if the user is barred or the session stopped.
    pub async fn register(&self, client: ClientHandle) -> Result<(), JoinRejection> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(SessionCommand::Register { client, reply })
            .await
            .map_err(|_| JoinRejection::Closed)?;
        outcome.await.unwrap_or(Err(JoinRejection::Closed))
    }

    /// Remove a connection. A no-op if the session already stopped.
    pub async fn unregister(&self, connection_id: ConnectionId) {
        let _ = self
            .commands
            .send(SessionCommand::Unregister { connection_id })
            .await;
    }

    /// Hand a client frame to the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has stopped.
    pub async fn deliver(
        &self,
        connection_id: ConnectionId,
        payload: String,
    ) -> Result<(), SessionClosed> {
        self.commands
            .send(SessionCommand::Inbound {
                connection_id,
                payload,
            })
            .await
            .map_err(|_| SessionClosed)
    }

    /// Send `message` to every client except `exclude`.
    pub async fn broadcast(&self, message: ServerMessage, exclude: Option<ConnectionId>) {
        let _ = self
            .commands
            .send(SessionCommand::Broadcast { message, exclude })
            .await;
    }

    /// Stop the session if it has been empty for `grace`. Returns whether it stopped.
    pub async fn reap(&self, grace: Duration) -> bool {
        let (reply, outcome) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Reap { grace, reply })
            .await
            .is_err()
        {
            return true;
        }
        outcome.await.unwrap_or(true)
    }

    /// Stop the session, closing every connection.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }

    /// Latest snapshot of the session.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the session task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Whether two handles refer to the same session task.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        self.commands.same_channel(&other.commands)
    }
}

pub(crate) struct Member {
    pub(crate) user: User,
    pub(crate) role: Role,
    sender: mpsc::Sender<Outbound>,
    joined: u64,
    last_activity: u64,
}

/// State owned by a session task.
pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) diagram_id: String,
    pub(crate) threat_model_id: String,
    /// Last persisted record, the template for the next store update.
    pub(crate) diagram: Diagram,
    pub(crate) history: OperationHistory,
    pub(crate) next_sequence: u64,
    pub(crate) clients: HashMap<ConnectionId, Member>,
    pub(crate) host: User,
    pub(crate) presenter: Option<User>,
    /// Canonical ids barred from rejoining.
    pub(crate) denied: HashSet<String>,
    pub(crate) state: SessionState,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: SessionConfig,
    joins: u64,
    created_at: u64,
    last_activity: u64,
    idle_since: Option<Instant>,
    info: Arc<RwLock<SessionInfo>>,
}

impl Session {
    fn new(
        diagram: Diagram,
        threat_model_id: &str,
        host: User,
        collaborators: Collaborators,
        config: SessionConfig,
    ) -> Self {
        let history = OperationHistory::from_diagram(&diagram, config.history_capacity);
        let now = current_timestamp_ms();
        let mut session = Self {
            id: Uuid::new_v4(),
            diagram_id: diagram.id.clone(),
            threat_model_id: threat_model_id.to_string(),
            next_sequence: diagram.update_vector.saturating_add(1),
            diagram,
            history,
            clients: HashMap::new(),
            presenter: Some(host.clone()),
            host,
            denied: HashSet::new(),
            state: SessionState::Active,
            collaborators,
            config,
            joins: 0,
            created_at: now,
            last_activity: now,
            idle_since: Some(Instant::now()),
            info: Arc::new(RwLock::new(SessionInfo {
                session_id: String::new(),
                diagram_id: String::new(),
                threat_model_id: String::new(),
                state: SessionState::Active,
                participant_count: 0,
                host: User::default(),
                current_presenter: None,
                update_vector: 0,
                history_len: 0,
                created_at: now,
                last_activity: now,
                idle_since: None,
            })),
        };
        session.publish_info();
        session
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        tracing::info!(
            session_id = %self.id,
            diagram_id = %self.diagram_id,
            threat_model_id = %self.threat_model_id,
            host = %self.host,
            update_vector = self.history.update_vector(),
            "Session started"
        );

        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Register { client, reply } => {
                    let outcome = self.register(client);
                    let _ = reply.send(outcome);
                }
                SessionCommand::Unregister { connection_id } => {
                    self.unregister(connection_id);
                }
                SessionCommand::Inbound {
                    connection_id,
                    payload,
                } => {
                    self.handle_inbound(connection_id, &payload).await;
                }
                SessionCommand::Broadcast { message, exclude } => {
                    self.broadcast(&message, exclude);
                }
                SessionCommand::Reap { grace, reply } => {
                    let idle = self.clients.is_empty()
                        && self.idle_since.is_some_and(|since| since.elapsed() >= grace);
                    let _ = reply.send(idle);
                    if idle {
                        tracing::info!(session_id = %self.id, diagram_id = %self.diagram_id, "Reaping idle session");
                        break;
                    }
                }
                SessionCommand::Shutdown => break,
            }
            self.publish_info();
        }

        self.close();
    }

    fn close(&mut self) {
        for member in self.clients.values() {
            let _ = member.sender.try_send(Outbound::Close {
                code: close_code::AWAY,
                reason: "session closed",
            });
        }
        self.clients.clear();
        self.state = SessionState::Closed;
        self.publish_info();
        tracing::info!(
            session_id = %self.id,
            diagram_id = %self.diagram_id,
            update_vector = self.history.update_vector(),
            "Session closed"
        );
    }

    fn register(&mut self, client: ClientHandle) -> Result<(), JoinRejection> {
        if client.user.is_anonymous() {
            return Err(JoinRejection::Anonymous);
        }
        if self.denied.contains(client.user.user_id()) {
            tracing::warn!(
                session_id = %self.id,
                user_id = %client.user.user_id(),
                "Removed user attempted to rejoin"
            );
            return Err(JoinRejection::Denied);
        }

        if self.state == SessionState::Closing {
            tracing::info!(session_id = %self.id, "Session reactivated");
        }
        self.state = SessionState::Active;
        self.idle_since = None;
        self.joins += 1;
        let now = current_timestamp_ms();
        self.last_activity = now;

        let connection_id = client.connection_id;
        tracing::info!(
            session_id = %self.id,
            diagram_id = %self.diagram_id,
            connection_id = %connection_id,
            user_id = %client.user.user_id(),
            role = client.role.as_str(),
            "Participant joined"
        );
        self.clients.insert(
            connection_id,
            Member {
                user: client.user,
                role: client.role,
                sender: client.sender,
                joined: self.joins,
                last_activity: now,
            },
        );

        let snapshot = self.snapshot_message();
        self.send_to(connection_id, &snapshot);
        let update = self.participants_message();
        self.broadcast(&update, None);
        Ok(())
    }

    fn unregister(&mut self, connection_id: ConnectionId) {
        if self.remove_connection(connection_id).is_some() && !self.clients.is_empty() {
            let update = self.participants_message();
            self.broadcast(&update, None);
        }
    }

    /// Drop a connection from the participant set and fix up roles.
    ///
    /// The presenter falls back to the host once the presenter's last
    /// connection is gone.
    pub(crate) fn remove_connection(&mut self, connection_id: ConnectionId) -> Option<User> {
        let member = self.clients.remove(&connection_id)?;
        let user = member.user;
        tracing::info!(
            session_id = %self.id,
            connection_id = %connection_id,
            user_id = %user.user_id(),
            remaining = self.clients.len(),
            "Participant left"
        );

        let presenting = self
            .presenter
            .as_ref()
            .is_some_and(|p| p.user_id() == user.user_id());
        if presenting && !self.is_host(&user) && self.connections_of(user.user_id()).is_empty() {
            tracing::info!(session_id = %self.id, user_id = %user.user_id(), "Presenter left, reverting to host");
            self.presenter = Some(self.host.clone());
        }

        if self.clients.is_empty() {
            self.state = SessionState::Closing;
            self.idle_since = Some(Instant::now());
            tracing::info!(session_id = %self.id, "Last participant left, session closing");
        }
        Some(user)
    }

    async fn handle_inbound(&mut self, connection_id: ConnectionId, payload: &str) {
        let Some(member) = self.clients.get_mut(&connection_id) else {
            tracing::debug!(session_id = %self.id, connection_id = %connection_id, "Frame from unknown connection ignored");
            return;
        };
        let now = current_timestamp_ms();
        member.last_activity = now;
        let user = member.user.clone();
        self.last_activity = now;

        let message = match router::route(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    connection_id = %connection_id,
                    user_id = %user.user_id(),
                    error = %e,
                    "Unroutable message"
                );
                record_validation_failure(e.code());
                self.send_error(connection_id, e.code(), e.to_string());
                return;
            }
        };
        let message_type = message.message_type();
        record_ws_message("inbound", message_type);
        tracing::debug!(session_id = %self.id, connection_id = %connection_id, message_type, "Dispatching");

        let origin = Origin {
            connection_id,
            user: user.clone(),
        };
        let outcome = AssertUnwindSafe(self.dispatch(origin, message))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            tracing::error!(
                session_id = %self.id,
                diagram_id = %self.diagram_id,
                connection_id = %connection_id,
                user_id = %user.user_id(),
                message_type,
                panic = %panic_message(panic.as_ref()),
                "Recovered from panic in message handler"
            );
            record_handler_panic(message_type);
            self.send_error(
                connection_id,
                codes::INTERNAL_ERROR,
                "Internal error while processing message",
            );
        }
    }

    /// The number the next accepted change will take.
    ///
    /// `u64::MAX` is never handed out, so a diagram whose vector reached it
    /// refuses further changes instead of wrapping.
    pub(crate) fn pending_sequence(&self) -> Result<u64, PatchRejection> {
        if self.next_sequence == u64::MAX {
            return Err(PatchRejection::new(
                RejectReason::SaveFailed,
                "Sequence numbers exhausted for this diagram",
            ));
        }
        Ok(self.next_sequence)
    }

    /// Consume the next sequence number.
    pub(crate) fn assign_sequence_number(&mut self) -> u64 {
        let sequence_number = self.next_sequence;
        self.next_sequence = sequence_number.saturating_add(1);
        sequence_number
    }

    pub(crate) fn is_host(&self, user: &User) -> bool {
        user.user_id() == self.host.user_id()
    }

    pub(crate) fn is_presenter(&self, user: &User) -> bool {
        self.presenter
            .as_ref()
            .is_some_and(|p| p.user_id() == user.user_id())
    }

    pub(crate) fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|(_, member)| member.user.user_id() == user_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Find a connected user by canonical id, falling back to email.
    pub(crate) fn find_connected(&self, claim: &User) -> Option<User> {
        if !claim.provider_id.is_empty() {
            if let Some(member) = self
                .clients
                .values()
                .find(|m| m.user.provider_id == claim.provider_id)
            {
                return Some(member.user.clone());
            }
        }
        if !claim.email.is_empty() {
            return self
                .clients
                .values()
                .find(|m| m.user.email.eq_ignore_ascii_case(&claim.email))
                .map(|m| m.user.clone());
        }
        None
    }

    pub(crate) fn snapshot_message(&self) -> ServerMessage {
        ServerMessage::DiagramState {
            diagram_id: self.diagram_id.clone(),
            update_vector: self.history.update_vector(),
            cells: self.history.current_state().to_cells(),
        }
    }

    /// One entry per user, in join order.
    pub(crate) fn participants_message(&self) -> ServerMessage {
        let mut members: Vec<&Member> = self.clients.values().collect();
        members.sort_by_key(|m| m.joined);

        let mut participants: Vec<Participant> = Vec::with_capacity(members.len());
        for member in members {
            if let Some(existing) = participants
                .iter_mut()
                .find(|p| p.user.user_id() == member.user.user_id())
            {
                existing.last_activity = existing.last_activity.max(member.last_activity);
                continue;
            }
            participants.push(Participant {
                user: member.user.clone(),
                permissions: member.role,
                last_activity: member.last_activity,
            });
        }

        ServerMessage::ParticipantsUpdate {
            participants,
            host: self.host.clone(),
            current_presenter: self.presenter.clone(),
        }
    }

    pub(crate) fn send_to(&mut self, connection_id: ConnectionId, message: &ServerMessage) {
        self.deliver(vec![connection_id], message);
    }

    pub(crate) fn send_to_user(&mut self, user_id: &str, message: &ServerMessage) {
        let targets = self.connections_of(user_id);
        self.deliver(targets, message);
    }

    pub(crate) fn send_error(
        &mut self,
        connection_id: ConnectionId,
        code: &str,
        message: impl Into<String>,
    ) {
        self.send_to(connection_id, &ServerMessage::error(code, message));
    }

    pub(crate) fn broadcast(&mut self, message: &ServerMessage, exclude: Option<ConnectionId>) {
        let targets: Vec<ConnectionId> = self
            .clients
            .keys()
            .copied()
            .filter(|id| Some(*id) != exclude)
            .collect();
        self.deliver(targets, message);
    }

    /// Queue a close frame for every connection of `user_id` and drop them.
    pub(crate) fn disconnect_user(&mut self, user_id: &str, code: u16, reason: &'static str) {
        for connection_id in self.connections_of(user_id) {
            if let Some(member) = self.clients.get(&connection_id) {
                let _ = member.sender.try_send(Outbound::Close { code, reason });
            }
            self.remove_connection(connection_id);
        }
    }

    fn deliver(&mut self, targets: Vec<ConnectionId>, message: &ServerMessage) {
        if targets.is_empty() {
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                tracing::error!(session_id = %self.id, message_type = message.message_type(), "Failed to serialize message: {}", e);
                return;
            }
        };

        let mut dropped = Vec::new();
        for connection_id in targets {
            let Some(member) = self.clients.get(&connection_id) else {
                continue;
            };
            match member.sender.try_send(Outbound::Text(text.clone())) {
                Ok(()) => record_ws_message("outbound", message.message_type()),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %self.id,
                        connection_id = %connection_id,
                        user_id = %member.user.user_id(),
                        "Outbound queue full, dropping slow client"
                    );
                    record_slow_client_dropped();
                    dropped.push(connection_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %self.id, connection_id = %connection_id, "Outbound queue closed");
                    dropped.push(connection_id);
                }
            }
        }

        let mut departed = false;
        for connection_id in dropped {
            departed |= self.remove_connection(connection_id).is_some();
        }
        if departed && !self.clients.is_empty() {
            let update = self.participants_message();
            self.broadcast(&update, None);
        }
    }

    fn publish_info(&self) {
        let mut info = self.info.write().unwrap_or_else(PoisonError::into_inner);
        *info = SessionInfo {
            session_id: self.id.to_string(),
            diagram_id: self.diagram_id.clone(),
            threat_model_id: self.threat_model_id.clone(),
            state: self.state,
            participant_count: self.clients.len(),
            host: self.host.clone(),
            current_presenter: self.presenter.clone(),
            update_vector: self.history.update_vector(),
            history_len: self.history.len(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            idle_since: self.idle_since,
        };
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use collab_core::{
        MemoryDiagramStore, MemoryIdentityDirectory, StaticAuthorization, StoreError,
    };
    use serde_json::Value;

    pub(crate) struct Fixture {
        pub(crate) store: Arc<MemoryDiagramStore>,
        pub(crate) authz: Arc<StaticAuthorization>,
        pub(crate) directory: Arc<MemoryIdentityDirectory>,
        pub(crate) config: SessionConfig,
        /// Replaces `store` for session writes when set.
        pub(crate) writes: Option<Arc<dyn DiagramStore>>,
    }

    impl Fixture {
        pub(crate) fn new(diagram: Diagram) -> Self {
            let store = Arc::new(MemoryDiagramStore::new());
            store.insert(diagram);
            Self {
                store,
                authz: Arc::new(StaticAuthorization::new()),
                directory: Arc::new(MemoryIdentityDirectory::new()),
                config: SessionConfig::default(),
                writes: None,
            }
        }

        /// Make every session write fail in the given way.
        pub(crate) fn with_write_fault(mut self, fault: WriteFault) -> Self {
            self.writes = Some(Arc::new(FaultyStore {
                inner: MemoryDiagramStore::clone(&self.store),
                fault,
            }));
            self
        }

        pub(crate) fn collaborators(&self) -> Collaborators {
            let store: Arc<dyn DiagramStore> = match &self.writes {
                Some(writes) => Arc::clone(writes),
                None => self.store.clone(),
            };
            Collaborators {
                store,
                authz: self.authz.clone(),
                identities: self.directory.clone(),
            }
        }

        pub(crate) async fn spawn(&self, diagram_id: &str, tm: &str, host: &User) -> SessionHandle {
            let diagram = self.store.get(diagram_id).await.expect("diagram exists");
            SessionHandle::spawn(
                diagram,
                tm,
                host.clone(),
                self.collaborators(),
                self.config.clone(),
            )
        }
    }

    /// How [`FaultyStore`] fails on update.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum WriteFault {
        Panic,
        Unavailable,
    }

    /// Reads from the wrapped store; updates fail.
    pub(crate) struct FaultyStore {
        inner: MemoryDiagramStore,
        fault: WriteFault,
    }

    #[async_trait::async_trait]
    impl DiagramStore for FaultyStore {
        async fn get(&self, diagram_id: &str) -> Result<Diagram, StoreError> {
            self.inner.get(diagram_id).await
        }

        async fn update(&self, _diagram_id: &str, _diagram: Diagram) -> Result<(), StoreError> {
            match self.fault {
                WriteFault::Panic => panic!("store exploded"),
                WriteFault::Unavailable => {
                    Err(StoreError::Unavailable("disk full".to_string()))
                }
            }
        }

        async fn put(&self, diagram: Diagram) -> Result<(), StoreError> {
            self.inner.put(diagram).await
        }
    }

    pub(crate) struct TestClient {
        pub(crate) connection_id: ConnectionId,
        pub(crate) user: User,
        pub(crate) rx: mpsc::Receiver<Outbound>,
    }

    impl TestClient {
        pub(crate) async fn join(session: &SessionHandle, user: &User) -> Self {
            Self::try_join(session, user).await.expect("join accepted")
        }

        pub(crate) async fn try_join(
            session: &SessionHandle,
            user: &User,
        ) -> Result<Self, JoinRejection> {
            let (tx, rx) = mpsc::channel(DEFAULT_CLIENT_BUFFER);
            let client = ClientHandle::new(user.clone(), Role::Writer, tx);
            let connection_id = client.connection_id;
            session.register(client).await?;
            Ok(Self {
                connection_id,
                user: user.clone(),
                rx,
            })
        }

        pub(crate) async fn send(&self, session: &SessionHandle, message: Value) {
            session
                .deliver(self.connection_id, message.to_string())
                .await
                .expect("session alive");
        }

        /// Next frame, or `None` once the queue is closed.
        pub(crate) async fn next(&mut self) -> Option<Outbound> {
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
        }

        pub(crate) async fn next_json(&mut self) -> Value {
            match self.next().await {
                Some(Outbound::Text(text)) => {
                    serde_json::from_str(text.as_str()).expect("valid json")
                }
                other => panic!("Expected text frame, got {other:?}"),
            }
        }

        pub(crate) async fn recv_type(&mut self, message_type: &str) -> Value {
            loop {
                let value = self.next_json().await;
                if value["message_type"] == message_type {
                    return value;
                }
            }
        }

        /// Drain frames already queued.
        pub(crate) fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Text(text) = frame {
                    frames.push(serde_json::from_str(text.as_str()).expect("valid json"));
                }
            }
            frames
        }
    }

    /// Wait until the session has processed everything queued so far.
    pub(crate) async fn settle(session: &SessionHandle) {
        let (tx, _rx) = mpsc::channel(1);
        let anonymous = ClientHandle::new(User::default(), Role::Reader, tx);
        // Anonymous joins are refused without side effects, so this is a pure round trip.
        let _ = session.register(anonymous).await;
    }

    pub(crate) fn alice() -> User {
        User::new("alice-id")
            .with_email("alice@example.com")
            .with_display_name("Alice")
    }

    pub(crate) fn bob() -> User {
        User::new("bob-id")
            .with_email("bob@example.com")
            .with_display_name("Bob")
    }

    pub(crate) fn carol() -> User {
        User::new("carol-id")
            .with_email("carol@example.com")
            .with_display_name("Carol")
    }
}
