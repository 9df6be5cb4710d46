//! Log-as-record subsystem.
//!
//! Operational events are persisted through the state store using the same
//! record shape as regular items, with an added level, so that washers can
//! subscribe to the log like any other source. Every persisted event is also
//! mirrored to `tracing` at the matching level; store failures degrade to a
//! `tracing` warning and never escalate.

use crate::item::Item;
use crate::store::StateStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// The different levels of logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Degraded but recoverable.
    Warn,
    /// A run or component failed.
    Error,
}

impl LogLevel {
    /// The lowercase string form stored in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the washer an event is attributed to.
#[derive(Clone, Debug)]
pub struct LogSource {
    /// Kind tag ("wash", "rinse", "dry", "fix").
    pub kind: &'static str,
    /// Washer family name.
    pub name: String,
    /// Washer instance id.
    pub id: String,
    /// Loggers can't log: set for Rinse/Dry washers subscribed to the log
    /// collection, whose own events would feed back into them.
    pub exempt: bool,
}

/// The payload of one log event.
#[derive(Clone, Debug, Default)]
pub struct LogMessage {
    /// Human-readable message. Defaults to the error text when absent.
    pub msg: Option<String>,
    /// Error text, for failure events.
    pub error: Option<String>,
    /// Any extra structured context.
    pub data: Map<String, Value>,
}

impl LogMessage {
    /// A plain text message.
    pub fn text(msg: impl Into<String>) -> Self {
        LogMessage {
            msg: Some(msg.into()),
            ..LogMessage::default()
        }
    }

    /// A message describing an error.
    pub fn from_error(error: &crate::error::Error) -> Self {
        LogMessage {
            msg: None,
            error: Some(error.to_string()),
            data: Map::new(),
        }
    }

    /// Attach structured context.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Writes operational events into the state store as item-shaped records.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn StateStore>,
}

impl Journal {
    /// Create a journal writing through the given store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Journal { store }
    }

    /// Record a debug event.
    pub async fn debug(&self, source: &LogSource, message: LogMessage) {
        self.write(LogLevel::Debug, source, message).await;
    }

    /// Record an info event.
    pub async fn info(&self, source: &LogSource, message: LogMessage) {
        self.write(LogLevel::Info, source, message).await;
    }

    /// Record a warning event.
    pub async fn warn(&self, source: &LogSource, message: LogMessage) {
        self.write(LogLevel::Warn, source, message).await;
    }

    /// Record an error event.
    pub async fn error(&self, source: &LogSource, message: LogMessage) {
        self.write(LogLevel::Error, source, message).await;
    }

    async fn write(&self, level: LogLevel, source: &LogSource, message: LogMessage) {
        let msg = message
            .msg
            .clone()
            .or_else(|| message.error.clone())
            .unwrap_or_default();

        match level {
            LogLevel::Debug => {
                tracing::debug!(washer = %source.id, name = %source.name, "{msg}")
            }
            LogLevel::Info => tracing::info!(washer = %source.id, name = %source.name, "{msg}"),
            LogLevel::Warn => tracing::warn!(washer = %source.id, name = %source.name, "{msg}"),
            LogLevel::Error => {
                tracing::error!(washer = %source.id, name = %source.name, "{msg}")
            }
        }

        // Loggers can't log: a washer consuming the log collection would
        // receive its own start/complete events as input, forever.
        if source.exempt {
            return;
        }

        let now = Utc::now();
        let url = format!(
            "laundromat://{}/{}/{}/{}",
            source.kind,
            source.name,
            source.id,
            now.timestamp_millis()
        );

        let mut meta = message.data;
        if let Some(error) = message.error {
            meta.insert("error".to_string(), Value::String(error));
        }

        let record = Item {
            url,
            washer_id: source.id.clone(),
            washer_name: source.name.clone(),
            created: Some(now),
            saved: Some(now),
            title: Some(msg.clone()),
            text: Some(msg),
            meta,
            ..Item::default()
        };

        if let Err(e) = self.store.write_log(level, &record).await {
            tracing::warn!(error = %e, washer = %source.id, "Failed to persist log record");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn events_are_written_as_item_shaped_records() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone());

        journal
            .info(
                &LogSource {
                    kind: "wash",
                    name: "test/wash".to_string(),
                    id: "a".to_string(),
                    exempt: false,
                },
                LogMessage::text("start"),
            )
            .await;

        let entries = store.log_entries().await;
        assert_eq!(entries.len(), 1);
        let (level, record) = &entries[0];
        assert_eq!(*level, LogLevel::Info);
        assert_eq!(record.washer_id, "a");
        assert_eq!(record.title.as_deref(), Some("start"));
        assert!(record.url.starts_with("laundromat://wash/test/wash/a/"));
        assert!(record.created.is_some() && record.saved.is_some());
    }

    #[tokio::test]
    async fn message_defaults_to_error_text() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone());

        let err = crate::error::Error::Other("boom".to_string());
        journal
            .error(
                &LogSource {
                    kind: "dry",
                    name: "test/dry".to_string(),
                    id: "b".to_string(),
                    exempt: false,
                },
                LogMessage::from_error(&err),
            )
            .await;

        let entries = store.log_entries().await;
        assert_eq!(entries[0].1.title.as_deref(), Some("boom"));
        assert_eq!(
            entries[0].1.meta.get("error").and_then(|v| v.as_str()),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn exempt_sources_are_never_persisted() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone());

        journal
            .info(
                &LogSource {
                    kind: "dry",
                    name: "test/dry".to_string(),
                    id: "b".to_string(),
                    exempt: true,
                },
                LogMessage::text("start"),
            )
            .await;

        assert!(store.log_entries().await.is_empty());
    }

    #[test]
    fn level_string_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::parse("verbose"), None);
    }
}
