//! State-store contract and per-washer memory.
//!
//! The engine talks to persistence exclusively through [`StateStore`]. Two
//! drivers ship with the crate:
//! - [`sqlite::SqliteStore`] — durable SQLite persistence via sqlx
//! - [`memory::MemoryStore`] — in-process maps, for tests and embedding
//!
//! Custom drivers implement the trait; `hydrate_item`/`dehydrate_item` have
//! default implementations that map through the item document form.

use crate::error::Result;
use crate::filter::Filter;
use crate::item::Item;
use crate::log::LogLevel;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

pub mod memory;
pub mod sqlite;

/// Per-washer persisted state.
///
/// The reserved fields (`last_run`, `last_duration`, `config`) belong to the
/// engine; washers keep their own incremental state in `state`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Memory {
    /// Watermark: the start time of the last successful run.
    pub last_run: DateTime<Utc>,

    /// How long the last successful run took, in milliseconds.
    pub last_duration: Option<i64>,

    /// Snapshot of the configuration used on the last run.
    #[serde(default)]
    pub config: Value,

    /// Opaque washer-owned state.
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl Memory {
    /// Memory for a washer's first run.
    ///
    /// The watermark starts at the epoch (load all history) unless a
    /// back-fill window of `begin_days` is configured.
    pub fn first_run(begin_days: i64) -> Self {
        let last_run = if begin_days > 0 {
            Utc::now() - ChronoDuration::days(begin_days)
        } else {
            DateTime::<Utc>::UNIX_EPOCH
        };
        Memory {
            last_run,
            last_duration: None,
            config: Value::Null,
            state: Map::new(),
        }
    }

    /// Read a value from the washer-owned state blob.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Write a value into the washer-owned state blob.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.insert(key.into(), value.into());
    }
}

/// The persistence contract the engine requires.
///
/// Implementations must be cheap to share (`Arc<dyn StateStore>`) and safe
/// to call from concurrent washer runs.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the store for use (run migrations, create collections).
    async fn init(&self) -> Result<()>;

    /// Map a raw stored document onto an [`Item`].
    fn hydrate_item(&self, raw: Value) -> Result<Item> {
        Item::from_document(raw)
    }

    /// Map an item onto its raw document form for storage.
    fn dehydrate_item(&self, item: &Item) -> Value {
        item.to_document()
    }

    /// Load a washer's memory, or `None` before its first successful run.
    async fn load_memory(&self, washer_id: &str) -> Result<Option<Memory>>;

    /// Persist a washer's memory.
    async fn save_memory(&self, washer_id: &str, memory: &Memory) -> Result<()>;

    /// Items from a washer's collection with `saved` newer than `since`,
    /// newest first, optionally narrowed by a filter.
    async fn load_items(
        &self,
        washer_id: &str,
        since: DateTime<Utc>,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>>;

    /// Upsert items by `url` into a washer's collection, stamping `saved`,
    /// then delete items whose `created` is older than `retain_cutoff`
    /// (`None` keeps everything).
    async fn save_items(
        &self,
        washer_id: &str,
        items: &[Item],
        retain_cutoff: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Subscribe to items as they are saved into a washer's collection.
    ///
    /// Filters are applied by the subscription engine on delivery, not here.
    fn subscribe_to_washer(&self, source_id: &str) -> broadcast::Receiver<Item>;

    /// Subscribe to log records as they are written.
    fn subscribe_to_log(&self) -> broadcast::Receiver<Item>;

    /// Append a log record. Callers treat failures as best-effort.
    async fn write_log(&self, level: LogLevel, record: &Item) -> Result<()>;

    /// Look up a previously saved item by URL.
    async fn existing(&self, washer_id: &str, url: &str) -> Result<Option<Item>>;
}
