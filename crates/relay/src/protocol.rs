//! Wire formats: backbone envelopes, connect parameters, presence.

use crate::error::{AuthFailure, RelayError, Result};
use axum::extract::ws::Message;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Longest accepted user identifier, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

// ============================================================================
// Backbone Envelope
// ============================================================================

/// How a string payload is encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Delivered as a text frame, as-is.
    #[default]
    Text,
    /// Base64 string decoded and delivered as a binary frame.
    Base64,
}

/// Opaque bytes delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into a WebSocket frame.
    pub fn into_message(self) -> Message {
        match self {
            Payload::Text(s) => Message::Text(s.into()),
            Payload::Binary(b) => Message::Binary(b),
        }
    }
}

/// On-the-wire shape. Unknown fields are ignored.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(alias = "to")]
    destination: String,
    payload: Box<RawValue>,
    #[serde(default)]
    encoding: PayloadEncoding,
}

#[derive(Serialize)]
struct WireEnvelopeOut<'a> {
    destination: &'a str,
    payload: &'a str,
    #[serde(skip_serializing_if = "is_text")]
    encoding: PayloadEncoding,
}

fn is_text(encoding: &PayloadEncoding) -> bool {
    *encoding == PayloadEncoding::Text
}

/// A routed message on the shared channel.
///
/// Format: `{"destination": "<user id>", "payload": <opaque>}`. The alias
/// `to` is accepted for `destination`. A string payload is delivered as its
/// contents; any other JSON value is delivered as its raw JSON text exactly
/// as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: String,
    pub payload: Payload,
}

impl Envelope {
    /// Envelope carrying a text payload.
    pub fn text(destination: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            payload: Payload::Text(payload.into()),
        }
    }

    /// Envelope carrying a binary payload.
    pub fn binary(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: Payload::Binary(payload.into()),
        }
    }

    /// Parse an envelope received from the backbone.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;

        if wire.destination.is_empty() {
            return Err(RelayError::MalformedEnvelope("empty destination".to_string()));
        }

        let raw = wire.payload.get();
        let payload = if raw.starts_with('"') {
            let s: String = serde_json::from_str(raw)
                .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;
            match wire.encoding {
                PayloadEncoding::Text => Payload::Text(s),
                PayloadEncoding::Base64 => {
                    let decoded = BASE64
                        .decode(s.as_bytes())
                        .map_err(|e| RelayError::MalformedEnvelope(format!("base64: {}", e)))?;
                    Payload::Binary(Bytes::from(decoded))
                }
            }
        } else if wire.encoding == PayloadEncoding::Base64 {
            return Err(RelayError::MalformedEnvelope(
                "base64 encoding requires a string payload".to_string(),
            ));
        } else {
            Payload::Text(raw.to_string())
        };

        Ok(Self {
            destination: wire.destination,
            payload,
        })
    }

    /// Serialize for publishing on the backbone.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let encoded;
        let (payload, encoding) = match &self.payload {
            Payload::Text(s) => (s.as_str(), PayloadEncoding::Text),
            Payload::Binary(b) => {
                encoded = BASE64.encode(b);
                (encoded.as_str(), PayloadEncoding::Base64)
            }
        };
        let out = WireEnvelopeOut {
            destination: &self.destination,
            payload,
            encoding,
        };
        Ok(Bytes::from(serde_json::to_vec(&out)?))
    }
}

// ============================================================================
// Connection Request
// ============================================================================

/// Query parameters on the WebSocket upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub token: Option<String>,
}

/// Credentials extracted from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub user_id: Option<String>,
    pub token: Option<String>,
}

impl ConnectRequest {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: Some(token.into()),
        }
    }

    /// Merge query parameters with an optional `Authorization` header value.
    /// The query token wins when both are present.
    pub fn from_parts(params: ConnectParams, authorization: Option<&str>) -> Self {
        let bearer = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self {
            user_id: params.user_id,
            token: params.token.filter(|t| !t.is_empty()).or(bearer),
        }
    }

    /// Validate and return `(user_id, token)`.
    pub fn credentials(&self) -> std::result::Result<(&str, &str), AuthFailure> {
        let user_id = self.user_id.as_deref().ok_or(AuthFailure::MissingUserId)?;
        validate_user_id(user_id)?;
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthFailure::MissingToken)?;
        Ok((user_id, token))
    }
}

/// Check a claimed user identifier.
pub fn validate_user_id(user_id: &str) -> std::result::Result<(), AuthFailure> {
    if user_id.is_empty() {
        return Err(AuthFailure::MissingUserId);
    }
    if user_id.len() > MAX_USER_ID_LEN
        || user_id.chars().any(|c| c.is_control() || c.is_whitespace())
    {
        return Err(AuthFailure::MalformedUserId);
    }
    Ok(())
}

// ============================================================================
// Presence
// ============================================================================

/// Announcement published when a user comes online or goes offline on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "presence")]
pub struct PresenceAnnouncement {
    pub user_id: String,
    pub node_id: String,
    pub online: bool,
}
