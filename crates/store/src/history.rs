/// Storage for per-pair chat transcripts.
use std::collections::HashMap;

use {async_trait::async_trait, tokio::sync::RwLock};

use crate::PairKey;

/// Append-only transcripts keyed by [`PairKey`]. Records are never deleted.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The transcript for `key`, or `None` if the pair never chatted.
    async fn get(&self, key: &PairKey) -> anyhow::Result<Option<String>>;

    /// Create an empty transcript. A no-op if one already exists.
    async fn create_empty(&self, key: &PairKey) -> anyhow::Result<()>;

    /// Append `line` to the transcript, creating it if missing.
    async fn append(&self, key: &PairKey, line: &str) -> anyhow::Result<()>;
}

// ── SQLite ──────────────────────────────────────────────────────────────────

/// SQLite-backed history store.
pub struct SqliteHistoryStore {
    pool: sqlx::SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `history` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS history (
                user1 TEXT NOT NULL,
                user2 TEXT NOT NULL,
                chat  TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (user1, user2)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn get(&self, key: &PairKey) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT chat FROM history WHERE user1 = ? AND user2 = ?")
                .bind(key.first())
                .bind(key.second())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(chat,)| chat))
    }

    async fn create_empty(&self, key: &PairKey) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO history (user1, user2, chat) VALUES (?, ?, '') ON CONFLICT(user1, user2) DO NOTHING",
        )
        .bind(key.first())
        .bind(key.second())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append(&self, key: &PairKey, line: &str) -> anyhow::Result<()> {
        // Single statement so concurrent appends from both sides never race.
        sqlx::query(
            r#"INSERT INTO history (user1, user2, chat) VALUES (?, ?, ?)
               ON CONFLICT(user1, user2) DO UPDATE SET chat = history.chat || excluded.chat"#,
        )
        .bind(key.first())
        .bind(key.second())
        .bind(line)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<PairKey, String>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn get(&self, key: &PairKey) -> anyhow::Result<Option<String>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn create_empty(&self, key: &PairKey) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .entry(key.clone())
            .or_default();
        Ok(())
    }

    async fn append(&self, key: &PairKey, line: &str) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push_str(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn HistoryStore) {
        let key = PairKey::new("bob", "alice");
        assert!(store.get(&key).await.unwrap().is_none());

        store.create_empty(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(""));

        store.append(&key, "alice> hi\n").await.unwrap();
        store
            .append(&PairKey::new("alice", "bob"), "bob> hey\n")
            .await
            .unwrap();

        // Re-creating does not wipe the transcript.
        store.create_empty(&key).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some("alice> hi\nbob> hey\n")
        );

        // Other pairs are untouched.
        assert!(
            store
                .get(&PairKey::new("alice", "carol"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sqlite_transcript() {
        let store = SqliteHistoryStore::new(crate::memory_pool().await);
        exercise(&store).await;
    }

    #[tokio::test]
    async fn in_memory_transcript() {
        exercise(&InMemoryHistoryStore::new()).await;
    }

    #[tokio::test]
    async fn append_without_record_creates_it() {
        let store = SqliteHistoryStore::new(crate::memory_pool().await);
        let key = PairKey::new("a", "b");
        store.append(&key, "a> x\n").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("a> x\n"));
    }
}
