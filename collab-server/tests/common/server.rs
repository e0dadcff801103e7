//! Test server harness for integration tests.
//!
//! Spins up the real collaboration router on a random port with in-memory
//! collaborators that tests can seed and inspect.

use std::net::SocketAddr;
use std::sync::Arc;

use collab_core::{Diagram, MemoryDiagramStore, MemoryIdentityDirectory, StaticAuthorization};
use collab_server::routes::router;
use collab_server::{AppState, ConnectionConfig, Hub, SessionConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A test server instance with control handles.
pub struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    store: MemoryDiagramStore,
    authz: StaticAuthorization,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a server with default limits and an empty grant table.
    pub async fn start() -> Self {
        Self::start_with(ConnectionConfig::default(), SessionConfig::default()).await
    }

    /// Start a server with custom limits.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or server fails to bind.
    pub async fn start_with(connection: ConnectionConfig, session: SessionConfig) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let store = MemoryDiagramStore::new();
        let authz = StaticAuthorization::new();
        let hub = Arc::new(Hub::new(
            Arc::new(store.clone()),
            Arc::new(authz.clone()),
            Arc::new(MemoryIdentityDirectory::new()),
            session,
        ));
        let app = router(AppState::new(Arc::clone(&hub), connection));

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        // Give the server a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            addr: actual_addr,
            hub,
            store,
            authz,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Seed a diagram.
    pub fn seed(&self, diagram: Diagram) {
        self.store.insert(diagram);
    }

    /// The backing diagram store.
    pub fn store(&self) -> &MemoryDiagramStore {
        &self.store
    }

    /// The grant table.
    pub fn authz(&self) -> &StaticAuthorization {
        &self.authz
    }

    /// The live session registry.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Get the server's socket address.
    #[allow(dead_code)]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL for a diagram inside a threat model.
    pub fn ws_url(&self, threat_model_id: &str, diagram_id: &str) -> String {
        format!(
            "ws://{}/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws",
            self.addr
        )
    }

    /// WebSocket URL for a diagram outside any threat model.
    pub fn unscoped_ws_url(&self, diagram_id: &str) -> String {
        format!("ws://{}/diagrams/{diagram_id}/ws", self.addr)
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(mut self) {
        self.hub.shutdown_all().await;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle).await;
    }
}
