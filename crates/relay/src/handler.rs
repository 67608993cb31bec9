//! Per-connection handler.
//!
//! One handler runs per accepted transport and is the only writer to it.
//!
//! ```text
//! Connecting ──► Authenticating ──► Authenticated ──► Closed
//!      │               │                                ▲
//!      └───────────────┴────────────────────────────────┘
//! ```
//!
//! While authenticated, the pump waits on, in priority order: server
//! shutdown, eviction, queued deliveries, inbound client frames and the
//! keepalive tick.

use crate::auth::Authenticator;
use crate::error::AuthFailure;
use crate::ingest::{IngestForwarder, Ingestor, DEFAULT_INGEST_QUEUE_SIZE};
use crate::protocol::{ConnectRequest, Payload};
use crate::registry::{Connection, ConnectionRegistry, DEFAULT_DELIVERY_QUEUE_SIZE};
use axum::extract::ws::{close_code, CloseFrame, Message};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close code sent to a connection replaced by a newer one for the same user.
pub const CLOSE_REPLACED: u16 = 4000;

/// Upper bound on sending the close frame during teardown.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authenticated,
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, Authenticating) | (Authenticating, Authenticated) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        }
    }
}

/// Why a handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed(AuthFailure),
    ClientClosed,
    TransportError,
    Evicted,
    IdleTimeout,
    /// A frame could not be written within the write timeout.
    WriteTimeout,
    Shutdown,
}

impl CloseReason {
    /// Close frame sent to the client, if any. Authentication failures get
    /// none so the client learns nothing about why it was refused.
    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            CloseReason::Evicted => (CLOSE_REPLACED, "replaced by newer connection"),
            CloseReason::IdleTimeout => (close_code::NORMAL, "idle timeout"),
            CloseReason::Shutdown => (close_code::AWAY, "server shutting down"),
            CloseReason::AuthFailed(_)
            | CloseReason::ClientClosed
            | CloseReason::TransportError
            | CloseReason::WriteTimeout => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub delivery_queue_size: usize,
    pub ingest_queue_size: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    /// Longest a single frame write may take before the peer is dropped.
    pub write_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            delivery_queue_size: DEFAULT_DELIVERY_QUEUE_SIZE,
            ingest_queue_size: DEFAULT_INGEST_QUEUE_SIZE,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Dependencies shared by every handler on this node.
pub struct HandlerContext {
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub ingestor: Arc<dyn Ingestor>,
    pub config: HandlerConfig,
    /// Fired when the server is stopping.
    pub shutdown: CancellationToken,
}

/// Owns one client connection from handshake to teardown.
pub struct ConnectionHandler {
    ctx: Arc<HandlerContext>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { ctx, state }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next`. Illegal transitions (including closing twice) are no-ops.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Drive the connection to completion.
    ///
    /// `sink` and `stream` are the two halves of the accepted transport;
    /// `request` carries the credentials from the upgrade request.
    pub async fn run<W, R, E>(self, mut sink: W, mut stream: R, request: ConnectRequest) -> CloseReason
    where
        W: Sink<Message> + Unpin + Send,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        self.transition(ConnectionState::Authenticating);

        let authenticated = tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => None,
            result = self.ctx.authenticator.authenticate(&request) => Some(result),
        };

        let user_id = match authenticated {
            Some(Ok(user_id)) => user_id,
            Some(Err(failure)) => {
                debug!(
                    "Refusing connection for {:?}: {}",
                    request.user_id.as_deref().unwrap_or("<none>"),
                    failure
                );
                counter!("relay_auth_failures_total", "reason" => failure_label(&failure))
                    .increment(1);
                return self.close(&mut sink, CloseReason::AuthFailed(failure)).await;
            }
            None => return self.close(&mut sink, CloseReason::Shutdown).await,
        };

        let (conn, deliveries) = Connection::new(user_id, self.ctx.config.delivery_queue_size);
        self.transition(ConnectionState::Authenticated);

        if let Some(evicted) = self.ctx.registry.register(conn.clone()) {
            // Only signals; the evicted handler closes its own transport.
            evicted.close();
        }

        counter!("relay_connections_total").increment(1);
        gauge!("relay_active_connections").set(self.ctx.registry.len() as f64);
        info!("User {} connected (connection {})", conn.user_id, conn.id);

        let forwarder = IngestForwarder::spawn(
            self.ctx.ingestor.clone(),
            conn.user_id.clone(),
            self.ctx.config.ingest_queue_size,
        );

        let reason = self
            .pump(&conn, deliveries, &forwarder, &mut sink, &mut stream)
            .await;

        self.ctx.registry.deregister(&conn);
        // Queued messages still reach the authority; nothing waits on it.
        drop(forwarder.finish());

        gauge!("relay_active_connections").set(self.ctx.registry.len() as f64);
        info!(
            "User {} disconnected (connection {}): {:?}",
            conn.user_id, conn.id, reason
        );

        self.close(&mut sink, reason).await
    }

    async fn pump<W, R, E>(
        &self,
        conn: &Arc<Connection>,
        mut deliveries: mpsc::Receiver<Payload>,
        forwarder: &IngestForwarder,
        sink: &mut W,
        stream: &mut R,
    ) -> CloseReason
    where
        W: Sink<Message> + Unpin + Send,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let ping_every = self.ctx.config.ping_interval;
        let idle_limit = self.ctx.config.idle_timeout.as_millis() as i64;
        let mut ping_interval = interval_at(Instant::now() + ping_every, ping_every);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.ctx.shutdown.cancelled() => return CloseReason::Shutdown,

                _ = conn.closed() => return CloseReason::Evicted,

                Some(payload) = deliveries.recv() => {
                    if let Some(reason) = self.write(conn, sink, payload.into_message()).await {
                        return reason;
                    }
                }

                frame = stream.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!("Transport error for {}: {}", conn.user_id, e);
                            return CloseReason::TransportError;
                        }
                        None => return CloseReason::ClientClosed,
                    };
                    conn.touch();

                    let inbound = match msg {
                        Message::Text(text) => Payload::Text(text.as_str().to_owned()),
                        Message::Binary(data) => Payload::Binary(data),
                        Message::Ping(data) => {
                            if let Some(reason) = self.write(conn, sink, Message::Pong(data)).await {
                                return reason;
                            }
                            continue;
                        }
                        Message::Pong(_) => continue,
                        Message::Close(_) => return CloseReason::ClientClosed,
                    };

                    if !forwarder.submit(inbound) {
                        warn!("Ingest queue full for {}, dropping client message", conn.user_id);
                    }
                }

                _ = ping_interval.tick() => {
                    if conn.idle_millis() > idle_limit {
                        return CloseReason::IdleTimeout;
                    }
                    if let Some(reason) = self.write(conn, sink, Message::Ping(Bytes::new())).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Write one frame. Returns why the connection must end if the write
    /// failed, stalled past the write timeout, or was overtaken by eviction
    /// or shutdown.
    async fn write<W>(&self, conn: &Connection, sink: &mut W, msg: Message) -> Option<CloseReason>
    where
        W: Sink<Message> + Unpin + Send,
        W::Error: Display,
    {
        let write_timeout = self.ctx.config.write_timeout;
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => Some(CloseReason::Shutdown),
            _ = conn.closed() => Some(CloseReason::Evicted),
            sent = tokio::time::timeout(write_timeout, sink.send(msg)) => match sent {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!("Write to {} failed: {}", conn.user_id, e);
                    Some(CloseReason::TransportError)
                }
                Err(_) => {
                    warn!("Write to {} stalled for {:?}", conn.user_id, write_timeout);
                    Some(CloseReason::WriteTimeout)
                }
            },
        }
    }

    async fn close<W>(&self, sink: &mut W, reason: CloseReason) -> CloseReason
    where
        W: Sink<Message> + Unpin + Send,
    {
        if self.transition(ConnectionState::Closed) {
            let frame = Message::Close(reason.close_frame());
            let closing = async {
                let _ = sink.send(frame).await;
                let _ = sink.close().await;
            };
            let limit = self.ctx.config.write_timeout.min(CLOSE_HANDSHAKE_TIMEOUT);
            if tokio::time::timeout(limit, closing)
                .await
                .is_err()
            {
                debug!("Close handshake timed out ({:?})", reason);
            }
        }
        reason
    }
}

fn failure_label(failure: &AuthFailure) -> &'static str {
    match failure {
        AuthFailure::MissingUserId | AuthFailure::MalformedUserId => "bad_user_id",
        AuthFailure::MissingToken => "missing_token",
        AuthFailure::InvalidToken => "invalid_token",
        AuthFailure::IdentityMismatch => "identity_mismatch",
        AuthFailure::ValidatorUnreachable { .. } => "validator_unreachable",
    }
}
