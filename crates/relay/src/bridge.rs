//! Fan-out bridge: backbone → local connections.
//!
//! Subscribes to the shared channel and hands each envelope to the local
//! connection registered for its destination. Envelopes for users not
//! connected to this node are ignored; another node owns them.
//!
//! The receive loop never waits on a connection: deliveries are `try_send`s
//! onto each connection's bounded queue, and a full queue drops the newest
//! delivery.

use crate::protocol::Envelope;
use crate::registry::{ConnectionRegistry, DeliveryOutcome};
use futures::StreamExt;
use metrics::counter;
use pubsub_client::{Backbone, MessageStream};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the fan-out bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Channels to subscribe to.
    pub channels: Vec<String>,
    /// Initial delay before resubscribing after a loss.
    pub reconnect_delay: Duration,
    /// Maximum resubscribe delay (for exponential backoff).
    pub max_reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channels: vec!["chat:global".to_string()],
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// What happened to one backbone message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queued for the destination's handler.
    Delivered,
    /// Destination not connected here.
    Miss,
    /// Destination's queue was full.
    Dropped,
    /// Could not be parsed.
    Malformed,
}

/// Bridge counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    received: AtomicU64,
    delivered: AtomicU64,
    misses: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub misses: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

enum StreamEnd {
    Shutdown,
    Lost,
}

/// Routes envelopes from the backbone to registered connections.
pub struct FanoutBridge {
    registry: Arc<ConnectionRegistry>,
    backbone: Arc<dyn Backbone>,
    config: BridgeConfig,
    stats: BridgeStats,
}

impl FanoutBridge {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backbone: Arc<dyn Backbone>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            registry,
            backbone,
            config,
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until `shutdown` fires, resubscribing with backoff whenever the
    /// subscription fails or ends.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting FanoutBridge on {} backbone, channels {:?}",
            self.backbone.kind(),
            self.config.channels
        );

        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.backbone.subscribe(&self.config.channels) => result,
            };

            match subscribed {
                Ok(stream) => {
                    info!("FanoutBridge subscribed");
                    reconnect_delay = self.config.reconnect_delay;
                    match self.pump(stream, &shutdown).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Lost => warn!("Backbone subscription ended unexpectedly"),
                    }
                }
                Err(e) => warn!("Backbone subscribe failed: {}", e),
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            counter!("relay_backbone_reconnects_total").increment(1);
            info!("Resubscribing in {:?}", reconnect_delay);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
        }

        info!("FanoutBridge stopped");
    }

    async fn pump(&self, mut stream: MessageStream, shutdown: &CancellationToken) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                msg = stream.next() => match msg {
                    Some(msg) => {
                        self.dispatch(&msg.payload);
                    }
                    None => return StreamEnd::Lost,
                },
            }
        }
    }

    /// Route one raw backbone message.
    pub fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        counter!("relay_envelopes_received_total").increment(1);

        let envelope = match Envelope::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope: {}", e);
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                counter!("relay_envelopes_malformed_total").increment(1);
                return DispatchOutcome::Malformed;
            }
        };

        let Some(conn) = self.registry.lookup(&envelope.destination) else {
            debug!("No local connection for {}", envelope.destination);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Miss;
        };

        let size = envelope.payload.len();
        match conn.deliver(envelope.payload) {
            DeliveryOutcome::Queued => {
                debug!("Queued {} bytes for {}", size, envelope.destination);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                counter!("relay_envelopes_delivered_total").increment(1);
                DispatchOutcome::Delivered
            }
            DeliveryOutcome::QueueFull => {
                warn!(
                    "Delivery queue full for {} (connection {}), dropping message",
                    envelope.destination, conn.id
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("relay_envelopes_dropped_total").increment(1);
                DispatchOutcome::Dropped
            }
            DeliveryOutcome::Closed => {
                // Handler is tearing down; same as not being connected.
                debug!("Connection {} for {} is closing", conn.id, envelope.destination);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Miss
            }
        }
    }
}
