//! SQLite persistence for keys and subscriptions
//!
//! Only what a user cannot recompute is stored: the raw descriptor, its group,
//! its identity, user edits and the subscription registry. Probe statistics
//! start fresh on every load.

use crate::server::record::ServerKey;
use crate::server::subscription::Subscription;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

const CREATE_KEYS: &str = r#"
CREATE TABLE IF NOT EXISTS keys (
    id          TEXT PRIMARY KEY NOT NULL,
    raw         TEXT NOT NULL,
    group_name  TEXT NOT NULL,
    name        TEXT NOT NULL,
    favorite    BOOLEAN NOT NULL DEFAULT 0,
    notes       TEXT NOT NULL DEFAULT '',
    position    INTEGER NOT NULL
)
"#;

const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id           TEXT PRIMARY KEY NOT NULL,
    name         TEXT NOT NULL,
    url          TEXT NOT NULL,
    enabled      BOOLEAN NOT NULL DEFAULT 1,
    last_update  TEXT,
    server_count INTEGER NOT NULL DEFAULT 0,
    position     INTEGER NOT NULL
)
"#;

#[derive(Debug, sqlx::FromRow)]
struct KeyRow {
    id: String,
    raw: String,
    group_name: String,
    name: String,
    favorite: bool,
    notes: String,
}

impl KeyRow {
    fn into_key(self) -> ServerKey {
        let mut key = ServerKey::new(&self.raw, &self.group_name);
        if key.id != self.id {
            tracing::warn!(
                stored = %self.id,
                derived = %key.id,
                "stored identity differs from descriptor, keeping stored"
            );
            key.id = self.id;
        }
        key.name = self.name;
        key.is_favorite = self.favorite;
        key.notes = self.notes;
        key
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    name: String,
    url: String,
    enabled: bool,
    last_update: Option<DateTime<Utc>>,
    server_count: i64,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            name: row.name,
            url: row.url,
            enabled: row.enabled,
            last_update: row.last_update,
            server_count: usize::try_from(row.server_count).unwrap_or_default(),
        }
    }
}

/// Key and subscription store backed by SQLite
#[derive(Clone)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    /// Open (creating if needed) a database file or `sqlite:` URL
    pub async fn open(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = if database_url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(database_url)?
        } else {
            SqliteConnectOptions::new().filename(database_url)
        }
        .create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(database = database_url, "key store opened");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_KEYS).execute(&self.pool).await?;
        sqlx::query(CREATE_SUBSCRIPTIONS).execute(&self.pool).await?;
        Ok(())
    }

    /// Replace the stored key list, preserving order
    ///
    /// Two keys with the same identity fail the whole save and leave the
    /// previous list in place.
    pub async fn save_keys(&self, keys: &[ServerKey]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM keys").execute(&mut *tx).await?;

        for (position, key) in keys.iter().enumerate() {
            sqlx::query(
                "INSERT INTO keys (id, raw, group_name, name, favorite, notes, position) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key.id)
            .bind(&key.raw)
            .bind(&key.group)
            .bind(&key.name)
            .bind(key.is_favorite)
            .bind(&key.notes)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!(count = keys.len(), "keys saved");
        Ok(())
    }

    /// Load keys in saved order with fresh statistics
    pub async fn load_keys(&self) -> Result<Vec<ServerKey>> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            "SELECT id, raw, group_name, name, favorite, notes FROM keys ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(KeyRow::into_key).collect())
    }

    pub async fn count_keys(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Replace the stored subscription registry, preserving order
    pub async fn save_subscriptions(&self, subscriptions: &[Subscription]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscriptions")
            .execute(&mut *tx)
            .await?;

        for (position, sub) in subscriptions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO subscriptions \
                 (id, name, url, enabled, last_update, server_count, position) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&sub.id)
            .bind(&sub.name)
            .bind(&sub.url)
            .bind(sub.enabled)
            .bind(sub.last_update)
            .bind(sub.server_count as i64)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!(count = subscriptions.len(), "subscriptions saved");
        Ok(())
    }

    pub async fn load_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT id, name, url, enabled, last_update, server_count \
             FROM subscriptions ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::record::DEFAULT_GROUP;

    #[tokio::test]
    async fn test_key_round_trip() {
        let store = KeyStore::in_memory().await.unwrap();

        let mut renamed = ServerKey::new("vless://id@a.test:443?security=reality#Orig", "Sub:free");
        renamed.name = "Office".to_string();
        renamed.is_favorite = true;
        renamed.notes = "fast at night".to_string();
        let broken = ServerKey::new("vmess://@@@", DEFAULT_GROUP);
        let plain = ServerKey::new("ssh://root@10.0.0.1:22#Box", DEFAULT_GROUP);
        let keys = vec![renamed, broken, plain];

        store.save_keys(&keys).await.unwrap();
        assert_eq!(store.count_keys().await.unwrap(), 3);

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 3);
        for (before, after) in keys.iter().zip(&loaded) {
            assert_eq!(before.raw, after.raw);
            assert_eq!(before.group, after.group);
            assert_eq!(before.id, after.id);
            assert_eq!(before.name, after.name);
            assert_eq!(before.is_favorite, after.is_favorite);
            assert_eq!(before.notes, after.notes);
            assert_eq!(after.total_tests, 0);
        }
        assert_eq!(loaded[0].display_name(), "★ Office");
        assert!(!loaded[1].config.is_valid());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_list() {
        let store = KeyStore::in_memory().await.unwrap();
        store
            .save_keys(&[
                ServerKey::new("trojan://pw@a.test:443#A", DEFAULT_GROUP),
                ServerKey::new("trojan://pw@b.test:443#B", DEFAULT_GROUP),
            ])
            .await
            .unwrap();
        store
            .save_keys(&[ServerKey::new("trojan://pw@c.test:443#C", DEFAULT_GROUP)])
            .await
            .unwrap();

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "C");
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let store = KeyStore::in_memory().await.unwrap();
        let kept = ServerKey::new("trojan://pw@a.test:443#A", DEFAULT_GROUP);
        store.save_keys(std::slice::from_ref(&kept)).await.unwrap();

        // Unparseable descriptors of one protocol share an identity
        let first = ServerKey::new("vmess://@@@", DEFAULT_GROUP);
        let second = ServerKey::new("vmess://%%%", DEFAULT_GROUP);
        assert_eq!(first.id, second.id);

        assert!(store.save_keys(&[first, second]).await.is_err());

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_subscription_round_trip() {
        let store = KeyStore::in_memory().await.unwrap();
        let mut updated = Subscription::new("free", "https://example.com/free");
        updated.last_update = Some(Utc::now());
        updated.server_count = 42;
        let mut disabled = Subscription::new("paid", "https://example.com/paid");
        disabled.enabled = false;

        let subs = vec![updated, disabled];
        store.save_subscriptions(&subs).await.unwrap();

        let loaded = store.load_subscriptions().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, subs[0].id);
        assert_eq!(loaded[0].server_count, 42);
        assert_eq!(
            loaded[0].last_update.map(|t| t.timestamp_millis()),
            subs[0].last_update.map(|t| t.timestamp_millis())
        );
        assert!(!loaded[1].enabled);
        assert!(loaded[1].last_update.is_none());
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let path = std::env::temp_dir().join(format!("keyprobe-store-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let path_str = path.to_string_lossy().to_string();

        {
            let store = KeyStore::open(&path_str).await.unwrap();
            store
                .save_keys(&[ServerKey::new("hy2://pw@h.test:443#Hy", DEFAULT_GROUP)])
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = KeyStore::open(&path_str).await.unwrap();
        let loaded = reopened.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].raw, "hy2://pw@h.test:443#Hy");
        reopened.close().await;

        let _ = std::fs::remove_file(&path);
    }
}
