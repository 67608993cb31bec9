//! Pub/sub backbone clients shared by relay nodes.
//!
//! Every relay node subscribes to the same logical channel(s) on a shared
//! backbone and filters incoming messages locally. This crate hides which
//! transport carries those channels:
//!
//! - Redis pub/sub (`redis://`, `rediss://`)
//! - NATS core subjects (`nats://`)
//! - In-process broadcast (`memory://`), for single-node runs and tests
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let backbone = pubsub_client::connect("redis://localhost:6379").await?;
//! let mut messages = backbone.subscribe(&["chat:global".to_string()]).await?;
//! while let Some(msg) = messages.next().await {
//!     println!("{}: {} bytes", msg.channel, msg.payload.len());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod nats_backbone;
pub mod redis_backbone;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::info;
use url::Url;

pub use error::{Error, Result};
pub use memory::MemoryBackbone;
pub use nats_backbone::NatsBackbone;
pub use redis_backbone::RedisBackbone;

/// A single message received from the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneMessage {
    /// Channel (Redis) or subject (NATS) the message arrived on.
    pub channel: String,
    /// Raw message body.
    pub payload: Bytes,
}

/// Stream of messages from an active subscription.
///
/// The stream ending means the subscription was lost; callers are expected
/// to resubscribe.
pub type MessageStream = BoxStream<'static, BackboneMessage>;

/// Publish/subscribe transport connecting relay nodes.
#[async_trait]
pub trait Backbone: Send + Sync + 'static {
    /// Short transport name for logs and health output.
    fn kind(&self) -> &'static str;

    /// Subscribe to all of `channels` on a single merged stream.
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream>;

    /// Publish a payload on a channel (fire-and-forget).
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
}

/// Connect to a backbone chosen by the URL scheme.
pub async fn connect(url: &str) -> Result<Arc<dyn Backbone>> {
    let parsed = Url::parse(url)?;
    let backbone: Arc<dyn Backbone> = match parsed.scheme() {
        "redis" | "rediss" => Arc::new(RedisBackbone::connect(url).await?),
        "nats" | "tls" => Arc::new(NatsBackbone::connect(url).await?),
        "memory" => Arc::new(MemoryBackbone::new()),
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    info!("Connected to {} backbone", backbone.kind());
    Ok(backbone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let backbone = connect("memory://").await.unwrap();
        assert_eq!(backbone.kind(), "memory");
    }

    #[tokio::test]
    async fn test_connect_unknown_scheme() {
        match connect("amqp://localhost:5672").await {
            Err(Error::UnsupportedScheme(scheme)) => assert_eq!(scheme, "amqp"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("amqp should not be supported"),
        }
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        assert!(matches!(connect("not a url").await, Err(Error::InvalidUrl(_))));
    }
}
