//! In-memory state store.
//!
//! Implements the full [`StateStore`] contract over process-local maps.
//! Useful for tests and for embedding the engine without durable
//! persistence; semantics (upsert by url, retention, newest-first loads,
//! insert notifications) match the SQLite driver.

use crate::error::Result;
use crate::filter::Filter;
use crate::item::Item;
use crate::log::LogLevel;
use crate::store::{Memory, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Broadcast buffer for insert notifications.
const CHANNEL_CAPACITY: usize = 256;

/// A [`StateStore`] backed by in-process maps.
#[derive(Default)]
pub struct MemoryStore {
    /// washer id -> url -> item
    items: tokio::sync::Mutex<HashMap<String, HashMap<String, Item>>>,
    memories: tokio::sync::Mutex<HashMap<String, Memory>>,
    log: tokio::sync::Mutex<Vec<(LogLevel, Item)>>,
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<Item>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<Item> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// All log records written so far, oldest first. Test helper.
    pub async fn log_entries(&self) -> Vec<(LogLevel, Item)> {
        self.log.lock().await.clone()
    }

    /// All items in a washer's collection, newest first. Test helper.
    pub async fn items_for(&self, washer_id: &str) -> Vec<Item> {
        let items = self.items.lock().await;
        let mut all: Vec<Item> = items
            .get(washer_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| b.saved.cmp(&a.saved));
        all
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn load_memory(&self, washer_id: &str) -> Result<Option<Memory>> {
        Ok(self.memories.lock().await.get(washer_id).cloned())
    }

    async fn save_memory(&self, washer_id: &str, memory: &Memory) -> Result<()> {
        self.memories
            .lock()
            .await
            .insert(washer_id.to_string(), memory.clone());
        Ok(())
    }

    async fn load_items(
        &self,
        washer_id: &str,
        since: DateTime<Utc>,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>> {
        let items = self.items.lock().await;
        let mut matching: Vec<Item> = items
            .get(washer_id)
            .map(|collection| {
                collection
                    .values()
                    .filter(|item| item.saved.is_some_and(|saved| saved > since))
                    .filter(|item| filter.is_none_or(|f| f.matches(item)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| b.saved.cmp(&a.saved));
        Ok(matching)
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
        {
            let mut collections = self.items.lock().await;
            let collection = collections.entry(washer_id.to_string()).or_default();

            for item in items {
                let mut saved = item.clone();
                saved.saved = Some(now);
                saved.downloads.clear();
                collection.insert(saved.url.clone(), saved.clone());
                // No receivers is fine; the notification is dropped
                sender.send(saved).ok();
            }

            if let Some(cutoff) = retain_cutoff {
                collection.retain(|_, item| {
                    item.created.is_none_or(|created| created >= cutoff)
                });
            }
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
        self.log.lock().await.push((level, record.clone()));
        self.sender(crate::config::LOG_COLLECTION)
            .send(record.clone())
            .ok();
        Ok(())
    }

    async fn existing(&self, washer_id: &str, url: &str) -> Result<Option<Item>> {
        Ok(self
            .items
            .lock()
            .await
            .get(washer_id)
            .and_then(|collection| collection.get(url))
            .cloned())
    }
}
