//! # Connection Hub
//!
//! Registry of live diagram sessions, keyed by diagram id. The hub creates a
//! session on first use, hands out handles to later joiners, and reaps
//! sessions that have been empty for longer than the grace period.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use collab_core::{
    AuthorizationService, DiagramStore, IdentityResolver, StoreError, User,
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::metrics::set_active_sessions;
use crate::session::{
    ClientHandle, Collaborators, JoinRejection, SessionConfig, SessionHandle, SessionInfo,
};

/// Default interval between reaper sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Default time an empty session survives before it is reaped.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(900);

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The diagram does not exist.
    #[error("diagram not found: {0}")]
    DiagramNotFound(String),
    /// The diagram's threat model is not the one requested. An empty
    /// `threat_model_id` means the unscoped route was used.
    #[error("diagram {diagram_id} is not reachable through threat model '{threat_model_id}'")]
    ThreatModelMismatch {
        /// Requested diagram.
        diagram_id: String,
        /// Requested threat model.
        threat_model_id: String,
    },
    /// The diagram store failed.
    #[error("diagram store error: {0}")]
    Store(#[from] StoreError),
    /// The session refused the connection.
    #[error("join rejected: {0}")]
    Join(JoinRejection),
}

/// Live session registry.
pub struct Hub {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    collaborators: Collaborators,
    config: SessionConfig,
}

impl Hub {
    /// Create a hub over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn DiagramStore>,
        authz: Arc<dyn AuthorizationService>,
        identities: Arc<dyn IdentityResolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            collaborators: Collaborators {
                store,
                authz,
                identities,
            },
            config,
        }
    }

    /// The diagram store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DiagramStore> {
        &self.collaborators.store
    }

    /// The authorization service.
    #[must_use]
    pub fn authorization(&self) -> &Arc<dyn AuthorizationService> {
        &self.collaborators.authz
    }

    /// Session settings.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Record a user seen on a connection, for later email lookups.
    pub fn observe_user(&self, user: &User) {
        self.collaborators.identities.observe(user);
    }

    /// The live session for `diagram_id`, if any.
    #[must_use]
    pub fn session(&self, diagram_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(diagram_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Start a session for a diagram, with `host` as host and presenter.
    ///
    /// Fails fast if the diagram is missing. If another caller created the
    /// session first, that session is returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DiagramNotFound`], [`HubError::ThreatModelMismatch`]
    /// or [`HubError::Store`].
    pub async fn create_session(
        &self,
        diagram_id: &str,
        threat_model_id: &str,
        host: &User,
    ) -> Result<SessionHandle, HubError> {
        let diagram = self
            .collaborators
            .store
            .get(diagram_id)
            .await
            .map_err(|e| match e {
                StoreError::DiagramNotFound(id) => HubError::DiagramNotFound(id),
                other => HubError::Store(other),
            })?;
        let scope = diagram.threat_model_id.clone().unwrap_or_default();
        check_scope(diagram_id, threat_model_id, &scope)?;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(diagram_id).filter(|h| !h.is_closed()) {
            return Ok(existing.clone());
        }
        let handle = SessionHandle::spawn(
            diagram,
            &scope,
            host.clone(),
            self.collaborators.clone(),
            self.config.clone(),
        );
        sessions.insert(diagram_id.to_string(), handle.clone());
        set_active_sessions(sessions.len());
        tracing::info!(
            diagram_id = %diagram_id,
            threat_model_id = %scope,
            host = %host,
            "Created collaboration session"
        );
        Ok(handle)
    }

    /// The live session for a diagram, creating it with `user` as host if needed.
    ///
    /// # Errors
    ///
    /// See [`Hub::create_session`].
    pub async fn session_for(
        &self,
        diagram_id: &str,
        threat_model_id: &str,
        user: &User,
    ) -> Result<SessionHandle, HubError> {
        if let Some(handle) = self.session(diagram_id) {
            let info = handle.info();
            check_scope(diagram_id, threat_model_id, &info.threat_model_id)?;
            return Ok(handle);
        }
        self.create_session(diagram_id, threat_model_id, user).await
    }

    /// Add a connection to the diagram's session.
    ///
    /// A session that stops while the join is in flight is replaced once.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Join`] if the session refuses the user, or any
    /// error from [`Hub::session_for`].
    pub async fn join(
        &self,
        diagram_id: &str,
        threat_model_id: &str,
        client: ClientHandle,
    ) -> Result<SessionHandle, HubError> {
        let user = client.user.clone();
        let mut retried = false;
        loop {
            let handle = self.session_for(diagram_id, threat_model_id, &user).await?;
            match handle.register(client.clone()).await {
                Ok(()) => return Ok(handle),
                Err(JoinRejection::Closed) if !retried => {
                    tracing::debug!(diagram_id = %diagram_id, "Session stopped during join, retrying");
                    self.forget(diagram_id, &handle);
                    retried = true;
                }
                Err(rejection) => return Err(HubError::Join(rejection)),
            }
        }
    }

    /// Summaries of all live sessions, ordered by diagram id.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .filter(|h| !h.is_closed())
            .map(SessionHandle::info)
            .collect();
        infos.sort_by(|a, b| a.diagram_id.cmp(&b.diagram_id));
        infos
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop sessions that have been empty for at least `grace`.
    ///
    /// Returns the number of sessions removed.
    pub async fn reap_idle(&self, grace: Duration) -> usize {
        let candidates: Vec<(String, SessionHandle)> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .iter()
                .filter(|(_, h)| h.is_closed() || h.info().participant_count == 0)
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect()
        };

        let mut reaped = 0;
        for (diagram_id, handle) in candidates {
            if handle.reap(grace).await {
                self.forget(&diagram_id, &handle);
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, remaining = self.session_count(), "Reaped idle sessions");
        }
        reaped
    }

    /// Run [`Hub::reap_idle`] every `interval` until the task is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, grace: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.reap_idle(grace).await;
            }
        })
    }

    /// Stop every session.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let handles = sessions.drain().map(|(_, h)| h).collect();
            set_active_sessions(0);
            handles
        };
        for handle in &handles {
            handle.shutdown().await;
        }
        tracing::info!(count = handles.len(), "All sessions shut down");
    }

    fn forget(&self, diagram_id: &str, handle: &SessionHandle) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(diagram_id)
            .is_some_and(|current| current.same_session(handle))
        {
            sessions.remove(diagram_id);
            set_active_sessions(sessions.len());
        }
    }
}

/// The requested threat model must be the diagram's own. Diagrams inside a
/// threat model are never reachable through the unscoped route, and unscoped
/// diagrams are never reachable through a threat model.
fn check_scope(diagram_id: &str, requested: &str, actual: &str) -> Result<(), HubError> {
    if requested == actual {
        Ok(())
    } else {
        Err(HubError::ThreatModelMismatch {
            diagram_id: diagram_id.to_string(),
            threat_model_id: requested.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Outbound, SessionState, DEFAULT_CLIENT_BUFFER};
    use collab_core::{
        Diagram, MemoryDiagramStore, MemoryIdentityDirectory, Role, StaticAuthorization,
    };
    use tokio::sync::mpsc;

    fn hub_with(diagrams: Vec<Diagram>) -> Hub {
        let store = MemoryDiagramStore::new();
        for diagram in diagrams {
            store.insert(diagram);
        }
        Hub::new(
            Arc::new(store),
            Arc::new(StaticAuthorization::open(Role::Writer)),
            Arc::new(MemoryIdentityDirectory::new()),
            SessionConfig::default(),
        )
    }

    fn client(user: &str) -> (ClientHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(DEFAULT_CLIENT_BUFFER);
        (ClientHandle::new(User::new(user), Role::Writer, tx), rx)
    }

    #[tokio::test]
    async fn test_create_fails_fast_for_missing_diagram() {
        let hub = hub_with(vec![]);
        let result = hub.create_session("nope", "", &User::new("alice")).await;
        assert!(matches!(result, Err(HubError::DiagramNotFound(_))));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_second_joiner_shares_session() {
        let hub = hub_with(vec![Diagram::new("d1", "Flows")]);
        let (a, _a_rx) = client("alice");
        let (b, _b_rx) = client("bob");
        let first = hub.join("d1", "", a).await.expect("alice joins");
        let second = hub.join("d1", "", b).await.expect("bob joins");
        assert!(first.same_session(&second));
        assert_eq!(hub.session_count(), 1);

        let info = first.info();
        assert_eq!(info.host.provider_id, "alice");
        assert_eq!(info.participant_count, 2);
    }

    #[tokio::test]
    async fn test_threat_model_mismatch() {
        let hub = hub_with(vec![Diagram::new("d1", "Flows").in_threat_model("tm1")]);
        let result = hub.session_for("d1", "tm2", &User::new("alice")).await;
        assert!(matches!(result, Err(HubError::ThreatModelMismatch { .. })));
        assert!(hub.session_for("d1", "tm1", &User::new("alice")).await.is_ok());
        let result = hub.session_for("d1", "tm2", &User::new("bob")).await;
        assert!(matches!(result, Err(HubError::ThreatModelMismatch { .. })));
    }

    #[tokio::test]
    async fn test_scoped_diagram_unreachable_without_threat_model() {
        let hub = hub_with(vec![
            Diagram::new("d1", "Flows").in_threat_model("tm1"),
            Diagram::new("loose", "Scratch"),
        ]);

        let result = hub.session_for("d1", "", &User::new("mallory")).await;
        assert!(matches!(result, Err(HubError::ThreatModelMismatch { .. })));
        assert_eq!(hub.session_count(), 0);

        let live = hub.session_for("d1", "tm1", &User::new("alice")).await.expect("scoped");
        assert_eq!(live.info().threat_model_id, "tm1");
        let result = hub.session_for("d1", "", &User::new("mallory")).await;
        assert!(matches!(result, Err(HubError::ThreatModelMismatch { .. })));

        let result = hub.session_for("loose", "tm1", &User::new("alice")).await;
        assert!(matches!(result, Err(HubError::ThreatModelMismatch { .. })));
    }

    #[tokio::test]
    async fn test_session_scope_comes_from_diagram() {
        let hub = hub_with(vec![Diagram::new("d1", "Flows").in_threat_model("tm1")]);
        let handle = hub
            .create_session("d1", "tm1", &User::new("alice"))
            .await
            .expect("session");
        assert_eq!(handle.info().threat_model_id, "tm1");
        assert_eq!(hub.active_sessions()[0].threat_model_id, "tm1");
    }

    #[tokio::test]
    async fn test_reaper_removes_only_idle_sessions() {
        let hub = hub_with(vec![Diagram::new("d1", "A"), Diagram::new("d2", "B")]);
        let (a, _a_rx) = client("alice");
        let (b, _b_rx) = client("bob");
        let b_id = b.connection_id;
        hub.join("d1", "", a).await.expect("join d1");
        let d2 = hub.join("d2", "", b).await.expect("join d2");
        d2.unregister(b_id).await;

        assert_eq!(hub.reap_idle(Duration::ZERO).await, 1);
        let remaining = hub.active_sessions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].diagram_id, "d1");
        assert!(hub.session("d2").is_none());
    }

    #[tokio::test]
    async fn test_reaper_honours_grace_and_rejoin_recreates() {
        let hub = hub_with(vec![Diagram::new("d1", "A")]);
        let (a, _a_rx) = client("alice");
        let a_id = a.connection_id;
        let handle = hub.join("d1", "", a).await.expect("join");
        handle.unregister(a_id).await;

        assert_eq!(hub.reap_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(handle.info().state, SessionState::Closing);

        assert_eq!(hub.reap_idle(Duration::ZERO).await, 1);
        assert_eq!(hub.session_count(), 0);

        let (b, _b_rx) = client("bob");
        let fresh = hub.join("d1", "", b).await.expect("rejoin");
        assert!(!fresh.same_session(&handle));
        assert_eq!(fresh.info().host.provider_id, "bob");
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let hub = hub_with(vec![Diagram::new("d1", "A")]);
        let (a, mut a_rx) = client("alice");
        hub.join("d1", "", a).await.expect("join");
        hub.shutdown_all().await;
        assert_eq!(hub.session_count(), 0);

        let mut closed = false;
        while let Some(frame) = a_rx.recv().await {
            closed |= matches!(frame, Outbound::Close { .. });
        }
        assert!(closed);
    }
}
