//! SQLite state-store driver.
//!
//! Durable persistence via sqlx: one `items` table partitioned by washer id,
//! a `memory` table holding per-washer state, and an append-only `log`
//! table. Insert notifications are fanned out over in-process broadcast
//! channels; subscriptions do not survive the process, matching the
//! single-process coordination model.

use crate::error::{Error, Result, StoreError};
use crate::filter::Filter;
use crate::item::Item;
use crate::log::LogLevel;
use crate::store::{Memory, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::broadcast;

/// Broadcast buffer for insert notifications.
const CHANNEL_CAPACITY: usize = 256;

/// A [`StateStore`] backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<Item>>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Store(StoreError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Store(StoreError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Store(StoreError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let store = Self {
            pool,
            channels: std::sync::Mutex::new(HashMap::new()),
        };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Store(StoreError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            self.migrate_v1().await?;
        }

        Ok(())
    }

    /// Migration v1: items, memory, and log tables.
    async fn migrate_v1(&self) -> Result<()> {
        tracing::info!("Applying database migration v1");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS items (
                washer_id TEXT NOT NULL,
                url TEXT NOT NULL,
                created INTEGER,
                saved INTEGER NOT NULL,
                doc TEXT NOT NULL,
                PRIMARY KEY (washer_id, url)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_items_saved ON items(washer_id, saved DESC)",
            "CREATE INDEX IF NOT EXISTS idx_items_created ON items(washer_id, created)",
            r#"
            CREATE TABLE IF NOT EXISTS memory (
                washer_id TEXT PRIMARY KEY,
                last_run INTEGER NOT NULL,
                last_duration INTEGER,
                config TEXT NOT NULL,
                state TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                washer_id TEXT,
                url TEXT NOT NULL,
                created INTEGER NOT NULL,
                doc TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_log_created ON log(created DESC)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                Error::Store(StoreError::MigrationFailed(format!(
                    "Migration v1 failed: {}",
                    e
                )))
            })?;
        }

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Store(StoreError::MigrationFailed(format!(
                    "Failed to record migration v1: {}",
                    e
                )))
            })?;

        Ok(())
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<Item> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn parse_doc(&self, doc: &str) -> Result<Item> {
        let raw: Value = serde_json::from_str(doc)?;
        self.hydrate_item(raw)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        // Connect already migrated; re-running is a no-op
        self.run_migrations().await
    }

    async fn load_memory(&self, washer_id: &str) -> Result<Option<Memory>> {
        let row = sqlx::query(
            "SELECT last_run, last_duration, config, state FROM memory WHERE washer_id = ?",
        )
        .bind(washer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::QueryFailed(format!(
                "Failed to load memory: {}",
                e
            )))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_run_millis: i64 = row.get("last_run");
        let last_run = Utc
            .timestamp_millis_opt(last_run_millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let config: String = row.get("config");
        let state: String = row.get("state");

        Ok(Some(Memory {
            last_run,
            last_duration: row.get("last_duration"),
            config: serde_json::from_str(&config).unwrap_or(Value::Null),
            state: serde_json::from_str(&state).unwrap_or_default(),
        }))
    }

    async fn save_memory(&self, washer_id: &str, memory: &Memory) -> Result<()> {
        let config = serde_json::to_string(&memory.config)?;
        let state = serde_json::to_string(&memory.state)?;

        sqlx::query(
            r#"
            INSERT INTO memory (washer_id, last_run, last_duration, config, state)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(washer_id) DO UPDATE SET
                last_run = excluded.last_run,
                last_duration = excluded.last_duration,
                config = excluded.config,
                state = excluded.state
            "#,
        )
        .bind(washer_id)
        .bind(memory.last_run.timestamp_millis())
        .bind(memory.last_duration)
        .bind(config)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::QueryFailed(format!(
                "Failed to save memory: {}",
                e
            )))
        })?;

        Ok(())
    }

    async fn load_items(
        &self,
        washer_id: &str,
        since: DateTime<Utc>,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            "SELECT doc FROM items WHERE washer_id = ? AND saved > ? ORDER BY saved DESC",
        )
        .bind(washer_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::QueryFailed(format!(
                "Failed to load items: {}",
                e
            )))
        })?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: String = row.get("doc");
            let item = self.parse_doc(&doc)?;
            if filter.is_none_or(|f| f.matches(&item)) {
                items.push(item);
            }
        }

        Ok(items)
    }

    async fn save_items(
        &self,
        washer_id: &str,
        items: &[Item],
        retain_cutoff: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let sender = self.sender(washer_id);

        for item in items {
            let mut stamped = item.clone();
            stamped.saved = Some(now);
            stamped.downloads.clear();
            let doc = serde_json::to_string(&self.dehydrate_item(&stamped))?;

            sqlx::query(
                r#"
                INSERT INTO items (washer_id, url, created, saved, doc)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(washer_id, url) DO UPDATE SET
                    created = excluded.created,
                    saved = excluded.saved,
                    doc = excluded.doc
                "#,
            )
            .bind(washer_id)
            .bind(&stamped.url)
            .bind(stamped.created.map(|c| c.timestamp_millis()))
            .bind(now.timestamp_millis())
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Store(StoreError::QueryFailed(format!(
                    "Failed to save item {}: {}",
                    stamped.url, e
                )))
            })?;

            // No receivers is fine; the notification is dropped
            sender.send(stamped).ok();
        }

        if let Some(cutoff) = retain_cutoff {
            sqlx::query("DELETE FROM items WHERE washer_id = ? AND created < ?")
                .bind(washer_id)
                .bind(cutoff.timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::Store(StoreError::QueryFailed(format!(
                        "Failed to apply retention: {}",
                        e
                    )))
                })?;
        }

        Ok(())
    }

    fn subscribe_to_washer(&self, source_id: &str) -> broadcast::Receiver<Item> {
        self.sender(source_id).subscribe()
    }

    fn subscribe_to_log(&self) -> broadcast::Receiver<Item> {
        self.sender(crate::config::LOG_COLLECTION).subscribe()
    }

    async fn write_log(&self, level: LogLevel, record: &Item) -> Result<()> {
        let doc = serde_json::to_string(&self.dehydrate_item(record))?;
        let created = record
            .created
            .unwrap_or_else(Utc::now)
            .timestamp_millis();

        sqlx::query(
            "INSERT INTO log (level, washer_id, url, created, doc) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(level.as_str())
        .bind(&record.washer_id)
        .bind(&record.url)
        .bind(created)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Store(StoreError::QueryFailed(format!(
                "Failed to write log record: {}",
                e
            )))
        })?;

        self.sender(crate::config::LOG_COLLECTION)
            .send(record.clone())
            .ok();

        Ok(())
    }

    async fn existing(&self, washer_id: &str, url: &str) -> Result<Option<Item>> {
        let row = sqlx::query("SELECT doc FROM items WHERE washer_id = ? AND url = ?")
            .bind(washer_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Store(StoreError::QueryFailed(format!(
                    "Failed to look up item: {}",
                    e
                )))
            })?;

        match row {
            Some(row) => {
                let doc: String = row.get("doc");
                Ok(Some(self.parse_doc(&doc)?))
            }
            None => Ok(None),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::retain_cutoff;
    use chrono::Duration as ChronoDuration;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&dir.path().join("laundromat.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn item(url: &str, created: DateTime<Utc>) -> Item {
        Item::new(url, created, "src", "test/wash").unwrap()
    }

    #[tokio::test]
    async fn connect_is_idempotent_about_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laundromat.db");
        let first = SqliteStore::connect(&path).await.unwrap();
        first.init().await.unwrap();
        drop(first);
        let second = SqliteStore::connect(&path).await.unwrap();
        second.init().await.unwrap();
    }

    #[tokio::test]
    async fn items_round_trip_with_newest_first_order() {
        let (_dir, store) = store().await;
        let now = Utc::now();

        store
            .save_items("src", &[item("https://e.com/1", now)], None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .save_items("src", &[item("https://e.com/2", now)], None)
            .await
            .unwrap();

        let loaded = store
            .load_items("src", DateTime::<Utc>::UNIX_EPOCH, None)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].url, "https://e.com/2", "newest saved first");
        assert!(loaded.iter().all(|i| i.saved.is_some()));
    }

    #[tokio::test]
    async fn upsert_by_url_keeps_one_row() {
        let (_dir, store) = store().await;
        let now = Utc::now();

        for _ in 0..3 {
            store
                .save_items("src", &[item("https://e.com/1", now)], None)
                .await
                .unwrap();
        }

        let loaded = store
            .load_items("src", DateTime::<Utc>::UNIX_EPOCH, None)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn retention_enforced_per_configured_policy() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let old = item("https://e.com/old", now - ChronoDuration::days(10));
        let fresh = item("https://e.com/fresh", now + ChronoDuration::minutes(1));

        // retain = 7 days: the old item goes, the fresh one stays
        store
            .save_items(
                "seven",
                &[old.clone(), fresh.clone()],
                retain_cutoff(Some(7), now),
            )
            .await
            .unwrap();
        let kept = store
            .load_items("seven", DateTime::<Utc>::UNIX_EPOCH, None)
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://e.com/fresh");

        // retain = 0: nothing is ever deleted
        store
            .save_items(
                "forever",
                &[old.clone(), fresh.clone()],
                retain_cutoff(Some(0), now),
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .load_items("forever", DateTime::<Utc>::UNIX_EPOCH, None)
                .await
                .unwrap()
                .len(),
            2
        );

        // retain unset: everything older than "now" is deleted immediately
        store
            .save_items("none", &[old, fresh], retain_cutoff(None, now))
            .await
            .unwrap();
        let kept = store
            .load_items("none", DateTime::<Utc>::UNIX_EPOCH, None)
            .await
            .unwrap();
        assert_eq!(kept.len(), 1, "only the not-yet-expired item survives");
        assert_eq!(kept[0].url, "https://e.com/fresh");
    }

    #[tokio::test]
    async fn memory_round_trips() {
        let (_dir, store) = store().await;

        assert!(store.load_memory("w").await.unwrap().is_none());

        let mut memory = Memory::first_run(0);
        memory.last_run = Utc::now();
        memory.last_duration = Some(1234);
        memory.set("cursor", "abc");
        store.save_memory("w", &memory).await.unwrap();

        let loaded = store.load_memory("w").await.unwrap().unwrap();
        assert_eq!(
            loaded.last_run.timestamp_millis(),
            memory.last_run.timestamp_millis()
        );
        assert_eq!(loaded.last_duration, Some(1234));
        assert_eq!(loaded.get("cursor").and_then(|v| v.as_str()), Some("abc"));
    }

    #[tokio::test]
    async fn log_records_notify_subscribers() {
        let (_dir, store) = store().await;
        let mut rx = store.subscribe_to_log();

        let record = item("laundromat://wash/test/src/1", Utc::now());
        store.write_log(LogLevel::Info, &record).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.url, "laundromat://wash/test/src/1");
    }

    #[tokio::test]
    async fn existing_looks_up_by_url() {
        let (_dir, store) = store().await;
        store
            .save_items("src", &[item("https://e.com/1", Utc::now())], None)
            .await
            .unwrap();

        assert!(store.existing("src", "https://e.com/1").await.unwrap().is_some());
        assert!(store.existing("src", "https://e.com/2").await.unwrap().is_none());
    }
}
