//! Pieces shared by the duet server and client.

pub mod heartbeat;

pub use heartbeat::{HeartbeatResult, HeartbeatSettings, Liveness, run_heartbeat};
