/// Config schema types (server, heartbeat).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::loader::data_dir;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DuetConfig {
    pub server: ServerConfig,
    /// Shared by both ends of a connection.
    pub heartbeat: HeartbeatConfig,
}

/// Server-only settings. The listen port comes from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind: String,

    /// SQLite database file, or `":memory:"` for an ephemeral store.
    /// Defaults to `~/.duet/duet.db`.
    pub database: Option<String>,

    /// Upper bound for writing one frame to a client.
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            database: None,
            write_timeout_secs: 5,
        }
    }
}

/// Where the credential and history tables live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

impl ServerConfig {
    pub fn database_location(&self) -> DatabaseLocation {
        match self.database.as_deref() {
            Some(":memory:") => DatabaseLocation::Memory,
            Some(path) => DatabaseLocation::File(PathBuf::from(path)),
            None => DatabaseLocation::File(data_dir().join("duet.db")),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

/// Liveness probing, see `duet_common::heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Bounded delivery timeout for a single probe.
    pub timeout_secs: u64,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}
