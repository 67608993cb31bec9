//! Backbone error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS connect error: {0}")]
    NatsConnect(#[from] async_nats::ConnectError),

    #[error("NATS subscription error: {0}")]
    NatsSubscribe(#[from] async_nats::SubscribeError),

    #[error("NATS publish error: {0}")]
    NatsPublish(#[from] async_nats::PublishError),

    #[error("Invalid backbone URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported backbone scheme: {0}")]
    UnsupportedScheme(String),

    #[error("No channels given to subscribe")]
    NoChannels,
}

pub type Result<T> = std::result::Result<T, Error>;
