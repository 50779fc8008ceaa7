/// Storage for user credentials.
use std::collections::HashMap;

use {async_trait::async_trait, tokio::sync::RwLock};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Stored credential for `name`, if the user exists.
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<String>>;

    /// Create a user. Returns `false` without touching the existing row if
    /// `name` is already taken.
    async fn insert(&self, name: &str, credential: &str) -> anyhow::Result<bool>;
}

// ── SQLite ──────────────────────────────────────────────────────────────────

/// SQLite-backed credential store.
pub struct SqliteCredentialStore {
    pool: sqlx::SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `users` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password FROM users WHERE username = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(password,)| password))
    }

    async fn insert(&self, name: &str, credential: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (username, password) VALUES (?, ?) ON CONFLICT(username) DO NOTHING",
        )
        .bind(name)
        .bind(credential)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.users.read().await.get(name).cloned())
    }

    async fn insert(&self, name: &str, credential: &str) -> anyhow::Result<bool> {
        let mut users = self.users.write().await;
        if users.contains_key(name) {
            return Ok(false);
        }
        users.insert(name.to_string(), credential.to_string());
        Ok(true)
    }
}
