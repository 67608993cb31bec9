//! Multi-node real-time message relay.
//!
//! Each relay node:
//! - Accepts WebSocket connections and authenticates them against a token
//!   validation service
//! - Keeps at most one live connection per user on this node
//! - Subscribes to a shared pub/sub backbone and delivers each envelope to
//!   its destination user if that user is connected here
//! - Forwards client-sent messages to a processing authority
//!
//! ## Architecture
//!
//! ```text
//! Backbone: chat:global (Redis / NATS)
//!         ↓
//! FanoutBridge (one subscription, local filtering)
//!         ↓
//! ConnectionRegistry (DashMap, user_id → connection)
//!         ↓ bounded per-connection queue
//! ConnectionHandler ──► WebSocket client
//!         │
//!         └──► Ingestor (client messages → authority)
//! ```
//!
//! Nodes share no state with each other; a user connected to another node
//! is simply a miss here.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handler;
pub mod ingest;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod ws_server;

pub use auth::{AuthConfig, Authenticator, HttpTokenValidator, StaticTokenValidator, TokenValidator, Verdict};
pub use bridge::{BridgeConfig, BridgeStatsSnapshot, DispatchOutcome, FanoutBridge};
pub use config::{ChannelTopology, RelayConfig};
pub use error::{AuthFailure, RelayError, Result};
pub use handler::{CloseReason, ConnectionHandler, ConnectionState, HandlerConfig, HandlerContext};
pub use ingest::{HttpIngestor, Ingestor, LogIngestor};
pub use presence::PresencePublisher;
pub use protocol::{ConnectParams, ConnectRequest, Envelope, Payload, PresenceAnnouncement};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, DeliveryOutcome, RegistryEvent};
pub use ws_server::{create_router, AppState, RelayHandle, RelayServer};
