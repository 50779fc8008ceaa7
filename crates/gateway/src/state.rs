use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    duet_common::HeartbeatSettings,
    duet_config::DuetConfig,
    duet_store::{CredentialStore, HistoryStore, InMemoryCredentialStore, InMemoryHistoryStore},
    tokio_util::task::TaskTracker,
};

use crate::{journal::HistoryJournal, registry::RegistryHandle};

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared server state, wrapped in Arc for use across connection tasks.
pub struct GatewayState {
    /// Presence and pairing ledger.
    pub registry: RegistryHandle,
    pub credentials: Arc<dyn CredentialStore>,
    /// Ordered access to chat transcripts.
    pub journal: HistoryJournal,
    pub heartbeat: HeartbeatSettings,
    /// Upper bound for writing one frame to a client.
    pub write_timeout: Duration,
    /// Server version string.
    pub version: String,
    pub hostname: String,
    /// Live connection tasks, awaited on shutdown.
    pub sessions: TaskTracker,
    conn_seq: AtomicU64,
}

impl GatewayState {
    /// Build the state and spawn its background actors. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: &DuetConfig,
        credentials: Arc<dyn CredentialStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            registry: RegistryHandle::spawn(),
            credentials,
            journal: HistoryJournal::spawn(history),
            heartbeat: HeartbeatSettings {
                interval: config.heartbeat.interval(),
                timeout: config.heartbeat.timeout(),
                max_missed: config.heartbeat.max_missed,
            },
            write_timeout: config.server.write_timeout(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            sessions: TaskTracker::new(),
            conn_seq: AtomicU64::new(0),
        })
    }

    /// Default settings with fresh in-memory stores.
    pub fn in_memory() -> Arc<Self> {
        Self::in_memory_with_history(Arc::new(InMemoryHistoryStore::new()))
    }

    /// Default settings, in-memory credentials, and the given history store.
    pub fn in_memory_with_history(history: Arc<dyn HistoryStore>) -> Arc<Self> {
        Self::new(
            &DuetConfig::default(),
            Arc::new(InMemoryCredentialStore::new()),
            history,
        )
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}
