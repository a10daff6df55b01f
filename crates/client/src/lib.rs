//! Skybridge gateway client
//!
//! Transport and streaming-protocol client for the Skybridge gateway. One
//! WebSocket connection carries everything: RPC requests with correlated
//! responses, broadcast events, and the multi-phase chat stream that turns
//! agent output into transcript entries.
//!
//! The [`GatewayClient`] handle is the public surface. It owns a background
//! connection task that reconnects with backoff, rejects pending RPCs on
//! disconnect, and applies chat and session events to the shared view.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod events;
pub mod rpc;
pub mod sessions;
pub mod stream;

pub use backoff::ReconnectPolicy;
pub use connection::{ClientConfig, ClientEvent, ClientView, ConnectionStatus, GatewayClient};
pub use error::Error;
pub use sessions::{SessionDirectory, SessionEffect, SessionEntry};
pub use stream::{ChatStream, TranscriptEntry};
