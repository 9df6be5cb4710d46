//! The normalized content record produced and consumed by washers.
//!
//! Every washer, regardless of the service it talks to, emits [`Item`]s. The
//! record is intentionally loose: only `url`, the producing washer, and
//! `created` matter to the engine; everything else is presentation data that
//! downstream consumers may or may not use.

use crate::download::Download;
use crate::error::{Error, Result, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalized unit of content.
///
/// URLs from a particular washer must be unique; the state store upserts by
/// `url` within the producing washer's collection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Item {
    /// URL to the item. Unique within the producing washer's collection.
    pub url: String,

    /// The user-defined unique id of the washer instance that produced this item.
    #[serde(default)]
    pub washer_id: String,

    /// The family name of the producing washer (shared by all instances).
    #[serde(default)]
    pub washer_name: String,

    /// The item's creation date, as reported by the source.
    ///
    /// `None` means the source value was missing or unparseable; such items
    /// are rejected before persistence.
    pub created: Option<DateTime<Utc>>,

    /// When the item was persisted. Set by the state store on write.
    pub saved: Option<DateTime<Utc>>,

    /// The title of this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Plain text content describing the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// HTML-formatted content describing the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    /// Shorter plain text content describing the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Tags, hashtags, or categories in which this item would appear.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// An image associated with this item, either a content-store path or a full URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// A description of the author of this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,

    /// A physical location associated with the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// A media enclosure suitable for podcast-style presentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Enclosure>,

    /// A description of where this item came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ItemSource>,

    /// Any arbitrary data to carry along with the item.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,

    /// Pending attachment fetches. Never persisted.
    #[serde(skip)]
    pub downloads: Vec<Download>,
}

/// Describes the author of an item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Author {
    /// Display name of the author.
    pub name: String,
    /// URL to the author's profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Path or URL to the author's avatar image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Describes the location of an item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Location {
    /// Human-readable place name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Latitude in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// A media file attached to an item which can be presented in a podcast
/// format or an inline media player.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Enclosure {
    /// Path to the file within the content store.
    pub file: String,
    /// Size of the file in bytes.
    pub size: u64,
    /// The MIME type of the file.
    pub mime: String,
}

/// Information about the source of an item, like a user profile or feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemSource {
    /// URL to a web page that shows where this item came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// A string describing the source, like a user name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// An image associated with the source, like a favicon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Item {
    /// Build a minimal item attributed to a washer.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is empty.
    pub fn new(
        url: impl Into<String>,
        created: DateTime<Utc>,
        washer_id: impl Into<String>,
        washer_name: impl Into<String>,
    ) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(Error::Other("invalid item: empty url".to_string()));
        }
        Ok(Item {
            url,
            washer_id: washer_id.into(),
            washer_name: washer_name.into(),
            created: Some(created),
            ..Item::default()
        })
    }

    /// Map a raw stored document onto an [`Item`].
    ///
    /// Timestamp fields are parsed leniently: RFC 3339 strings and epoch
    /// milliseconds are accepted, anything else becomes `None` so that
    /// validation can reject the item instead of the whole batch failing.
    pub fn from_document(mut raw: Value) -> Result<Self> {
        let obj = raw.as_object_mut().ok_or_else(|| {
            StoreError::MalformedDocument("item document is not an object".to_string())
        })?;
        let created = obj.remove("created").and_then(parse_timestamp);
        let saved = obj.remove("saved").and_then(parse_timestamp);

        let mut item: Item = serde_json::from_value(raw)?;
        item.created = created;
        item.saved = saved;
        Ok(item)
    }

    /// Map this item onto a raw document for storage.
    ///
    /// The transient download list is dropped; timestamps serialize as
    /// RFC 3339 strings. The store is responsible for stamping `saved`
    /// before calling this.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parse a document timestamp, tolerating the shapes sources actually produce.
fn parse_timestamp(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
