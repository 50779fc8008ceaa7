//! Persistence behind the chat server: user credentials and per-pair
//! transcripts.
//!
//! Both stores are traits so the server only depends on their read/write
//! contract. SQLite implementations back a real deployment; in-memory ones
//! serve tests and throwaway runs.

pub mod credentials;
pub mod history;
pub mod key;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub use {
    credentials::{CredentialStore, InMemoryCredentialStore, SqliteCredentialStore},
    history::{HistoryStore, InMemoryHistoryStore, SqliteHistoryStore},
    key::PairKey,
};

/// Open (creating if needed) the SQLite database at `path` and make sure
/// both tables exist.
pub async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    init(&pool).await?;
    Ok(pool)
}

/// Create every table this crate uses.
pub async fn init(pool: &SqlitePool) -> anyhow::Result<()> {
    SqliteCredentialStore::init(pool).await?;
    SqliteHistoryStore::init(pool).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    // A single long-lived connection: every new connection to
    // `sqlite::memory:` would see an empty database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init(&pool).await.unwrap();
    pool
}
