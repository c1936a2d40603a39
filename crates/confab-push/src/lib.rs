//! Confab Push - the single authenticated push connection
//!
//! This crate owns one push connection per authenticated session, reconnects
//! with exponential backoff, and routes incoming `{type, data}` frames to typed
//! subscribers. It knows nothing about what the events mean.

pub mod backoff;
pub mod client;
pub mod frame;
pub mod transport;

pub use backoff::Backoff;
pub use client::{
    ConnectionState, CredentialSource, PushError, PushTransport, StaticCredentials, Subscription,
    TransportOptions,
};
pub use frame::Frame;
pub use transport::{Connector, FrameStream, WsConnector};

/// Heartbeat reply, swallowed by the dispatcher
pub const PONG: &str = "pong";

/// Heartbeat request sent by the client on every heartbeat tick
pub const PING: &str = "ping";
