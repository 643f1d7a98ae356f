//! # rqsim-relay: room-based WebSocket message relay
//!
//! Clients connect over WebSocket and send JSON messages tagged with a room
//! code. Every message is rebroadcast to every connection that has sent under
//! the same code, the sender included.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  upgrade   ┌─────────────┐  Envelope  ┌────────────┐
//! │ Client   │ ─────────► │ Ingress     │ ─────────► │ Dispatcher │
//! │ (ws/json)│            │ (per conn)  │            │ (queue)    │
//! └──────────┘            └──────┬──────┘            └─────┬──────┘
//!       ▲                        │ register                │
//!       │                        ▼                         ▼
//!       │                 ┌─────────────┐  snapshot  ┌────────────┐
//!       │                 │ Registry    │ ◄───────── │ Broadcast  │
//!       │                 │ room → conns│   evict    │ Loop       │
//!       │                 └─────────────┘            └─────┬──────┘
//!       └──────────────────── writer task ◄───── send ─────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: `{code, message}` JSON wire format
//! - [`connection`]: upgrade, receive, non-blocking send, close
//! - [`registry`]: synchronized room membership
//! - [`dispatcher`]: ordered queue from ingress to broadcast
//! - [`broadcast`]: fan-out with eviction of failed recipients
//! - [`ingress`]: per-connection state machine
//! - [`server`]: accept loop and configuration

pub mod broadcast;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod protocol;
pub mod registry;
pub mod server;

pub use error::{ProtocolError, RelayError};
pub use protocol::{Envelope, RoomMessage};
pub use server::{RelayServer, ServerConfig};
