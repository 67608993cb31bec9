//! NATS core backbone.

use crate::error::{Error, Result};
use crate::{Backbone, BackboneMessage, MessageStream};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::info;

/// Wrapper around the NATS client using core (non-JetStream) subjects.
///
/// Core subjects are push-based and fire-and-forget, which matches the
/// relay's at-most-once delivery.
#[derive(Clone)]
pub struct NatsBackbone {
    client: Client,
}

impl NatsBackbone {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Backbone for NatsBackbone {
    fn kind(&self) -> &'static str {
        "nats"
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        if channels.is_empty() {
            return Err(Error::NoChannels);
        }

        let mut subscribers = Vec::with_capacity(channels.len());
        for channel in channels {
            info!("Subscribing to NATS subject: {}", channel);
            let subscriber = self.client.subscribe(channel.clone()).await?;
            subscribers.push(subscriber.map(|msg| BackboneMessage {
                channel: msg.subject.to_string(),
                payload: msg.payload,
            }));
        }

        Ok(stream::select_all(subscribers).boxed())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.client.publish(channel.to_string(), payload).await?;
        Ok(())
    }
}
