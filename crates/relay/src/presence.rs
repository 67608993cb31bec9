//! Presence announcements for node-addressed topologies.
//!
//! Publishes `online`/`offline` records for users on this node so producers
//! can address the node channel directly instead of the shared one.
//! Replacing a connection keeps the user online and is not announced.

use crate::protocol::PresenceAnnouncement;
use crate::registry::RegistryEvent;
use bytes::Bytes;
use pubsub_client::Backbone;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PresencePublisher {
    events: broadcast::Receiver<RegistryEvent>,
    backbone: Arc<dyn Backbone>,
    channel: String,
    node_id: String,
}

impl PresencePublisher {
    /// `events` should be subscribed before any connection is accepted.
    pub fn new(
        events: broadcast::Receiver<RegistryEvent>,
        backbone: Arc<dyn Backbone>,
        channel: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            events,
            backbone,
            channel: channel.into(),
            node_id: node_id.into(),
        }
    }

    fn announcement(&self, event: &RegistryEvent) -> Option<PresenceAnnouncement> {
        let (user_id, online) = match event {
            RegistryEvent::Registered { user_id, .. } => (user_id, true),
            RegistryEvent::Deregistered { user_id, .. } => (user_id, false),
            RegistryEvent::Evicted { .. } => return None,
        };
        Some(PresenceAnnouncement {
            user_id: user_id.clone(),
            node_id: self.node_id.clone(),
            online,
        })
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Publishing presence for node {} on {}", self.node_id, self.channel);

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!("Presence publisher lagged, {} registry events skipped", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Some(announcement) = self.announcement(&event) else {
                continue;
            };

            let payload = match serde_json::to_vec(&announcement) {
                Ok(payload) => Bytes::from(payload),
                Err(e) => {
                    warn!("Failed to encode presence: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.backbone.publish(&self.channel, payload).await {
                warn!("Failed to publish presence for {}: {}", announcement.user_id, e);
            } else {
                debug!(
                    "Presence {} {}",
                    announcement.user_id,
                    if announcement.online { "online" } else { "offline" }
                );
            }
        }

        info!("Presence publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, ConnectionRegistry};
    use futures::StreamExt;
    use pubsub_client::MemoryBackbone;

    #[tokio::test]
    async fn test_announces_online_and_offline() {
        let registry = ConnectionRegistry::new();
        let backbone = Arc::new(MemoryBackbone::new());
        let mut announcements = backbone
            .subscribe(&["chat:global:presence".to_string()])
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let publisher = PresencePublisher::new(
            registry.subscribe_events(),
            backbone.clone(),
            "chat:global:presence",
            "node-1",
        );
        let task = tokio::spawn(publisher.run(shutdown.clone()));

        let (first, _rx1) = Connection::new("alice", 4);
        let (second, _rx2) = Connection::new("alice", 4);
        registry.register(first.clone());
        registry.register(second.clone());
        registry.deregister(&first);
        registry.deregister(&second);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let msg = announcements.next().await.unwrap();
            seen.push(serde_json::from_slice::<PresenceAnnouncement>(&msg.payload).unwrap());
        }

        let online = |online| PresenceAnnouncement {
            user_id: "alice".into(),
            node_id: "node-1".into(),
            online,
        };
        assert_eq!(seen, vec![online(true), online(true), online(false)]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
