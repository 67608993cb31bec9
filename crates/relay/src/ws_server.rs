//! WebSocket server and relay node lifecycle.

use crate::auth::{Authenticator, TokenValidator};
use crate::bridge::{BridgeConfig, BridgeStatsSnapshot, FanoutBridge};
use crate::config::{ChannelTopology, RelayConfig};
use crate::error::{RelayError, Result};
use crate::handler::{ConnectionHandler, HandlerContext};
use crate::ingest::Ingestor;
use crate::presence::PresencePublisher;
use crate::protocol::{ConnectParams, ConnectRequest};
use crate::registry::ConnectionRegistry;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use pubsub_client::Backbone;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared application state.
pub struct AppState {
    pub node_id: String,
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<FanoutBridge>,
    pub handlers: Arc<HandlerContext>,
    /// Tracks connection handlers so shutdown can wait for them.
    pub tracker: TaskTracker,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "node_id": state.node_id,
        "connections": state.registry.len(),
        "bridge": state.bridge.stats(),
    }))
}

/// WebSocket upgrade handler.
///
/// Credentials come from `?user_id=&token=`; a bearer `Authorization`
/// header is accepted when the query carries no token.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let request = ConnectRequest::from_parts(params, authorization);

    ws.on_upgrade(move |socket| {
        let handler = ConnectionHandler::new(state.handlers.clone());
        state.tracker.track_future(async move {
            let (sink, stream) = socket.split();
            handler.run(sink, stream, request).await;
        })
    })
}

/// Entry point for running a relay node.
pub struct RelayServer;

impl RelayServer {
    /// Bind the listener and start serving.
    ///
    /// Returns once the node is accepting connections. The backbone
    /// subscription is established in the background and retried until
    /// [`RelayHandle::stop`] is called.
    pub async fn start(
        config: RelayConfig,
        validator: Arc<dyn TokenValidator>,
        ingestor: Arc<dyn Ingestor>,
        backbone: Arc<dyn Backbone>,
    ) -> Result<RelayHandle> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        if config.topology == ChannelTopology::PerNode {
            let presence = PresencePublisher::new(
                registry.subscribe_events(),
                backbone.clone(),
                config.presence_channel(),
                config.node_id.clone(),
            );
            tracker.spawn(presence.run(shutdown.clone()));
        }

        let bridge = Arc::new(FanoutBridge::new(
            registry.clone(),
            backbone,
            BridgeConfig {
                channels: config.channels(),
                ..BridgeConfig::default()
            },
        ));
        tracker.spawn(bridge.clone().run(shutdown.clone()));

        let handlers = Arc::new(HandlerContext {
            registry: registry.clone(),
            authenticator: Arc::new(Authenticator::new(validator, config.auth_config())),
            ingestor,
            config: config.handler_config(),
            shutdown: shutdown.clone(),
        });

        let state = Arc::new(AppState {
            node_id: config.node_id.clone(),
            registry: registry.clone(),
            bridge: bridge.clone(),
            handlers,
            tracker: tracker.clone(),
        });

        let app = create_router(state);
        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await
        });

        info!("Relay node {} listening on {}", config.node_id, local_addr);

        Ok(RelayHandle {
            local_addr,
            node_id: config.node_id,
            registry,
            bridge,
            shutdown,
            tracker,
            server: Some(server),
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// Handle to a running relay node.
pub struct RelayHandle {
    local_addr: SocketAddr,
    node_id: String,
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<FanoutBridge>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    server: Option<JoinHandle<std::io::Result<()>>>,
    shutdown_grace: Duration,
}

impl RelayHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bridge_stats(&self) -> BridgeStatsSnapshot {
        self.bridge.stats()
    }

    /// Resolve when the HTTP server exits on its own, e.g. a listener failure.
    ///
    /// Cancel-safe: dropping this future leaves the server for `stop` to join.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        let joined = server.await;
        self.server = None;
        flatten(joined)
    }

    /// Stop accepting connections, close every open connection, and
    /// unsubscribe from the backbone. Waits up to the shutdown grace period.
    pub async fn stop(mut self) -> Result<()> {
        info!("Stopping relay node {}", self.node_id);

        self.shutdown.cancel();
        let signalled = self.registry.close_all();
        self.tracker.close();
        info!("Signalled {} open connections to close", signalled);

        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} tasks still running after {:?}",
                self.tracker.len(),
                self.shutdown_grace
            );
        }

        let result = match self.server.take() {
            Some(mut server) => {
                match tokio::time::timeout(self.shutdown_grace, &mut server).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        warn!("HTTP server did not stop within {:?}, aborting", self.shutdown_grace);
                        server.abort();
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        };

        info!("Relay node {} stopped", self.node_id);
        result
    }
}

fn flatten(joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(RelayError::from),
        Err(e) => {
            error!("HTTP server task failed: {}", e);
            Err(RelayError::Io(std::io::Error::other(e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::ingest::LogIngestor;
    use pubsub_client::MemoryBackbone;

    fn test_config() -> RelayConfig {
        RelayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: "node-test".into(),
            static_tokens: Some("t:alice".into()),
            shutdown_grace: Duration::from_secs(2),
            ..RelayConfig::default()
        }
    }

    async fn start() -> RelayHandle {
        RelayServer::start(
            test_config(),
            Arc::new(StaticTokenValidator::new().with_token("t", "alice")),
            Arc::new(LogIngestor),
            Arc::new(MemoryBackbone::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_node() {
        let handle = start().await;
        let url = format!("http://{}/health", handle.local_addr());

        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node_id"], "node-test");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["bridge"]["delivered"], 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_abandoned_wait_joins_server() {
        let mut handle = start().await;
        let addr = handle.local_addr();

        tokio::select! {
            _ = handle.wait() => panic!("server exited on its own"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        assert!(handle.server.is_some());

        handle.stop().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_releases_listener() {
        let handle = start().await;
        let addr = handle.local_addr();
        handle.stop().await.unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
