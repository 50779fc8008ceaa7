//! Chat server: WebSocket endpoint, per-connection sessions, the online
//! registry and transcript persistence.
//!
//! Lifecycle:
//! 1. Open the credential and history stores
//! 2. Spawn the registry and history journal actors
//! 3. Serve `/health` and the WebSocket upgrade
//! 4. On ctrl-c or SIGTERM, send `ServerStop` to every session and drain

pub mod auth;
pub mod journal;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;
