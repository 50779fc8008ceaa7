//! Wire protocol shared by the duet server and client.
//!
//! Every application message travels as one WebSocket text frame holding a
//! tagged envelope:
//!
//! ```text
//! {"type": "<Tag>", "data": <payload>}
//! ```
//!
//! `data` is omitted for tags that carry no payload. The payload shape is
//! fixed by the tag, so the envelope is modelled as a single sum type
//! ([`Message`]) and validated when decoded.

mod error;
mod message;

pub use {
    error::{AuthError, PairingError, ProtocolError},
    message::{Message, TAGS},
};

/// Protocol revision reported by the server health endpoint.
pub const PROTOCOL_VERSION: u32 = 1;

/// HTTP path the server upgrades to a WebSocket.
pub const WS_PATH: &str = "/ws";

/// Build the WebSocket URL a client dials for `host:port`.
pub fn ws_url(addr: &str) -> String {
    format!("ws://{addr}{WS_PATH}")
}
