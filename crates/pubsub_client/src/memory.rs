//! In-process backbone built on a tokio broadcast channel.
//!
//! Useful for running a single relay node without external infrastructure
//! and for tests. All channels share one broadcast queue; subscribers filter
//! by channel name locally.

use crate::error::{Error, Result};
use crate::{Backbone, BackboneMessage, MessageStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default broadcast capacity. Lagging subscribers skip messages.
pub const DEFAULT_CAPACITY: usize = 4096;

/// In-process backbone.
pub struct MemoryBackbone {
    sender: RwLock<broadcast::Sender<BackboneMessage>>,
    capacity: usize,
}

impl MemoryBackbone {
    /// Create a backbone with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a backbone with an explicit broadcast capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(sender),
            capacity,
        }
    }

    /// End every active subscription stream, as if the transport dropped.
    ///
    /// New subscriptions made afterwards work normally.
    pub fn sever(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        if let Ok(mut current) = self.sender.write() {
            *current = sender;
        }
    }

    /// Number of live subscription streams.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .map(|s| s.receiver_count())
            .unwrap_or_default()
    }

    fn subscribe_raw(&self) -> broadcast::Receiver<BackboneMessage> {
        match self.sender.read() {
            Ok(sender) => sender.subscribe(),
            Err(poisoned) => poisoned.into_inner().subscribe(),
        }
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        if channels.is_empty() {
            return Err(Error::NoChannels);
        }

        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let rx = self.subscribe_raw();

        let stream = stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, (rx, wanted))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Memory backbone subscriber lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let msg = BackboneMessage {
            channel: channel.to_string(),
            payload,
        };
        let sender = match self.sender.read() {
            Ok(sender) => sender.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        // No receivers is not an error: nobody is listening on any node.
        if sender.send(msg).is_err() {
            debug!("Published on {} with no subscribers", channel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let backbone = MemoryBackbone::new();
        let mut stream = backbone.subscribe(&channels(&["chat:global"])).await.unwrap();

        backbone
            .publish("chat:global", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "chat:global");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_filters_other_channels() {
        let backbone = MemoryBackbone::new();
        let mut stream = backbone.subscribe(&channels(&["a", "b"])).await.unwrap();

        backbone.publish("c", Bytes::from_static(b"skip")).await.unwrap();
        backbone.publish("b", Bytes::from_static(b"keep")).await.unwrap();

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "b");
        assert_eq!(msg.payload, Bytes::from_static(b"keep"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let backbone = MemoryBackbone::new();
        assert!(backbone.publish("nobody", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_ends_streams() {
        let backbone = MemoryBackbone::new();
        let mut stream = backbone.subscribe(&channels(&["a"])).await.unwrap();
        assert_eq!(backbone.subscriber_count(), 1);

        backbone.sever();
        assert!(stream.next().await.is_none());

        // Resubscribing after a sever works.
        let mut stream = backbone.subscribe(&channels(&["a"])).await.unwrap();
        backbone.publish("a", Bytes::from_static(b"again")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().payload, Bytes::from_static(b"again"));
    }

    #[tokio::test]
    async fn test_empty_channel_list() {
        let backbone = MemoryBackbone::new();
        assert!(matches!(backbone.subscribe(&[]).await, Err(Error::NoChannels)));
    }
}
