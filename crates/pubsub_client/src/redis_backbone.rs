//! Redis pub/sub backbone.

use crate::error::{Error, Result};
use crate::{Backbone, BackboneMessage, MessageStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Redis-backed backbone.
///
/// Subscriptions use a dedicated pub/sub connection per call; publishing
/// goes through a multiplexed connection opened on demand.
#[derive(Clone)]
pub struct RedisBackbone {
    client: Arc<redis::Client>,
}

impl RedisBackbone {
    /// Open a client and verify the server is reachable.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        if channels.is_empty() {
            return Err(Error::NoChannels);
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            info!("Subscribing to Redis channel: {}", channel);
            pubsub.subscribe(channel).await?;
        }

        let stream = pubsub.into_on_message().map(|msg| BackboneMessage {
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let receivers: i64 = conn.publish(channel, &payload[..]).await?;
        debug!("Published {} bytes on {} ({} receivers)", payload.len(), channel, receivers);
        Ok(())
    }
}
