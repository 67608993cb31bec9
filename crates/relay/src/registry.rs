//! Connection registry: user identifier → live connection on this node.
//!
//! Backed by a sharded `DashMap`, so register/deregister/lookup each lock a
//! single shard for the duration of one map operation. Nothing here blocks on
//! I/O and nothing here closes transports; callers own that.
//!
//! Invariants:
//! - at most one registered connection per user identifier;
//! - `deregister` only removes the exact connection it is given, so a stale
//!   handler can never evict a newer registration for the same user.

use crate::protocol::Payload;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier of one accepted transport.
pub type ConnectionId = Uuid;

/// Default capacity of a connection's delivery queue.
pub const DEFAULT_DELIVERY_QUEUE_SIZE: usize = 256;

/// Capacity of the registry event stream.
const EVENT_CAPACITY: usize = 1024;

/// Result of handing a payload to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Payload is queued for the handler to write.
    Queued,
    /// Queue was full; the payload was dropped.
    QueueFull,
    /// Handler has already gone away.
    Closed,
}

/// A live, authenticated client session on this node.
///
/// The transport itself stays with the connection handler; this is the part
/// other tasks may touch: the delivery queue sender, activity timestamps and
/// the close signal.
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Authenticated user identifier.
    pub user_id: String,
    /// Delivery queue drained by the connection handler.
    tx: mpsc::Sender<Payload>,
    /// Unix millis when the connection authenticated.
    pub connected_at: i64,
    /// Unix millis of the last inbound frame.
    last_activity: AtomicI64,
    /// Deliveries dropped because the queue was full.
    dropped: AtomicU64,
    /// Fired to ask the handler to close the transport.
    closer: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end of its delivery queue.
    pub fn new(user_id: impl Into<String>, queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let now = Utc::now().timestamp_millis();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tx,
            connected_at: now,
            last_activity: AtomicI64::new(now),
            dropped: AtomicU64::new(0),
            closer: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Queue a payload without waiting. A full queue drops the new payload.
    pub fn deliver(&self, payload: Payload) -> DeliveryOutcome {
        match self.tx.try_send(payload) {
            Ok(()) => DeliveryOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Unix millis of the last inbound activity.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last inbound activity.
    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_activity()
    }

    /// Deliveries dropped for this connection.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the owning handler to close the transport. Idempotent.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry mutation, published to `subscribe_events` listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        user_id: String,
        connection_id: ConnectionId,
    },
    /// A prior connection was replaced by a newer one for the same user.
    Evicted {
        user_id: String,
        connection_id: ConnectionId,
    },
    Deregistered {
        user_id: String,
        connection_id: ConnectionId,
    },
}

/// Registry of connections held by this node.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connections: DashMap::new(),
            events,
        }
    }

    /// Register a connection under its user identifier.
    ///
    /// Atomically replaces any prior connection for that user and returns it
    /// so the caller can close it outside the registry.
    ///
    /// Events are emitted while the entry is held, so their order matches the
    /// order of map mutations for that user.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let user_id = conn.user_id.clone();
        let connection_id = conn.id;

        match self.connections.entry(user_id.clone()) {
            Entry::Occupied(mut entry) => {
                let old = entry.insert(conn);
                info!(
                    "User {} reconnected: connection {} replaces {}",
                    user_id, connection_id, old.id
                );
                self.emit(RegistryEvent::Evicted {
                    user_id: user_id.clone(),
                    connection_id: old.id,
                });
                self.emit(RegistryEvent::Registered {
                    user_id,
                    connection_id,
                });
                drop(entry);
                Some(old)
            }
            Entry::Vacant(entry) => {
                let registered = entry.insert(conn);
                debug!("User {} registered on connection {}", user_id, connection_id);
                self.emit(RegistryEvent::Registered {
                    user_id,
                    connection_id,
                });
                drop(registered);
                None
            }
        }
    }

    /// Remove a connection, but only if it is still the registered one.
    ///
    /// Returns `true` if the mapping was removed.
    pub fn deregister(&self, conn: &Connection) -> bool {
        match self.connections.entry(conn.user_id.clone()) {
            Entry::Occupied(entry) if entry.get().id == conn.id => {
                debug!("User {} deregistered (connection {})", conn.user_id, conn.id);
                self.emit(RegistryEvent::Deregistered {
                    user_id: conn.user_id.clone(),
                    connection_id: conn.id,
                });
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Current connection for a user, if any.
    pub fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(user_id).map(|r| r.clone())
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of registered user identifiers.
    pub fn user_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Signal every registered connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let conns: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for conn in &conns {
            conn.close();
        }
        conns.len()
    }

    /// Stream of registry mutations.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No listeners is the normal case.
        let _ = self.events.send(event);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
