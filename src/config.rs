//! Configuration types for laundromat
//!
//! Every washer kind gets one explicit, fully-enumerated configuration
//! struct; there is no option-map layering. Configs are validated once at
//! washer construction and are immutable for the process lifetime.
//! [`EngineConfig`] holds the engine-level settings (directories, external
//! tool, HTTP client, retry policy), organized into nested sub-configs.

use crate::error::{Error, Result};
use crate::filter::Filter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// The reserved collection id that log records are written to.
///
/// Rinse and Dry washers may subscribe to it; washer ids may not start
/// with it.
pub const LOG_COLLECTION: &str = "log";

/// Configuration for a Wash washer: retrieve data on a schedule and parse it
/// into the normalized format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WashConfig {
    /// Unique identifier for this washer instance.
    pub id: String,

    /// Whether this washer runs at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to persist memory between runs (default: true).
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Cron expression driving this washer's runs.
    pub schedule: String,

    /// Days of past items to load on the first run. `0` loads all history.
    #[serde(default)]
    pub begin: i64,

    /// Days to keep persisted items. `Some(0)` keeps them forever; `None`
    /// or a negative value deletes items as soon as they age past "now".
    #[serde(default)]
    pub retain: Option<i64>,

    /// Whether to resolve attached downloads (default: false).
    #[serde(default)]
    pub download: bool,

    /// Concurrent downloads allowed for this washer's group (default: 4).
    #[serde(default = "default_download_pool")]
    pub download_pool: usize,
}

/// Configuration for a Rinse washer: subscribe to sources and emit
/// transformed items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RinseConfig {
    /// Unique identifier for this washer instance.
    pub id: String,

    /// Whether this washer runs at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to persist memory between runs (default: true).
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Cron expression for polling mode. Absent means real-time mode.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Source washer ids (or [`LOG_COLLECTION`]) to consume items from.
    pub subscribe: Vec<String>,

    /// Only receive items matching this filter.
    #[serde(default)]
    pub filter: Option<Filter>,

    /// Days of past items to load on the first run. `0` loads all history.
    #[serde(default)]
    pub begin: i64,

    /// Days to keep persisted items. See [`WashConfig::retain`].
    #[serde(default)]
    pub retain: Option<i64>,

    /// Whether to resolve attached downloads (default: false).
    #[serde(default)]
    pub download: bool,

    /// Concurrent downloads allowed for this washer's group (default: 4).
    #[serde(default = "default_download_pool")]
    pub download_pool: usize,
}

/// Configuration for a Dry washer: subscribe to sources and act on items
/// without emitting any.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DryConfig {
    /// Unique identifier for this washer instance.
    pub id: String,

    /// Whether this washer runs at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to persist memory between runs (default: true).
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Cron expression for polling mode. Absent means real-time mode.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Source washer ids (or [`LOG_COLLECTION`]) to consume items from.
    pub subscribe: Vec<String>,

    /// Only receive items matching this filter.
    #[serde(default)]
    pub filter: Option<Filter>,
}

/// Configuration for a Fix washer: scheduled maintenance with no item flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FixConfig {
    /// Unique identifier for this washer instance.
    pub id: String,

    /// Whether this washer runs at all (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to persist memory between runs (default: true).
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Cron expression driving this washer's runs.
    pub schedule: String,
}

/// Storage locations used by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for per-download temporary directories (default: "./cache/downloads").
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Root of the filesystem content store (default: "./files").
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            content_dir: default_content_dir(),
        }
    }
}

/// External media tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the media extraction tool (auto-detected if None).
    #[serde(default)]
    pub tool_path: Option<PathBuf>,

    /// Whether to search PATH for the tool when no explicit path is set
    /// (default: true).
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_path: None,
            search_path: true,
        }
    }
}

/// HTTP client configuration for queued requests and direct downloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout (default: 30 seconds).
    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
        }
    }
}

/// Retry behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Engine-level configuration.
///
/// Fields are organized into logical sub-configs:
/// - [`storage`](StorageConfig) — temp and content directories
/// - [`tools`](ToolsConfig) — external media tool discovery
/// - [`http`](HttpConfig) — outbound HTTP client
/// - [`retry`](RetryConfig) — retry policy for downloads and queued requests
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// External tool settings.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_true() -> bool {
    true
}

fn default_download_pool() -> usize {
    4
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./cache/downloads")
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("./files")
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

static ID_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn id_pattern() -> Option<&'static Regex> {
    // Compiled from a literal; the fallible path exists only to satisfy the
    // no-unwrap rule
    ID_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").ok())
        .as_ref()
}

/// Validate a washer id: non-empty, restricted character set, and not within
/// the reserved log namespace.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::config("id", "missing id"));
    }
    if !id_pattern().is_some_and(|p| p.is_match(id)) {
        return Err(Error::config(
            "id",
            format!("id '{id}' contains characters outside [A-Za-z0-9._-]"),
        ));
    }
    if id.starts_with(LOG_COLLECTION) {
        return Err(Error::config(
            "id",
            format!("id '{id}' starts with the reserved '{LOG_COLLECTION}' prefix"),
        ));
    }
    Ok(())
}

/// Validate a cron schedule expression.
pub(crate) fn validate_schedule(expr: &str) -> Result<()> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| Error::Schedule(format!("'{expr}': {e}")))
}

/// Validate a subscription list against the subscribing washer's own id.
///
/// Existence of the referenced sources is checked later, when the engine
/// wires washers together and knows the full source set.
pub(crate) fn validate_subscribe(id: &str, subscribe: &[String]) -> Result<()> {
    if subscribe.is_empty() {
        return Err(Error::config("subscribe", "missing subscribe"));
    }
    if subscribe.iter().any(|s| s == id) {
        return Err(Error::config(
            "subscribe",
            "a washer can't subscribe to itself",
        ));
    }
    Ok(())
}

/// Enforce that retention outlasts back-fill when both are configured.
pub(crate) fn validate_retain_begin(retain: Option<i64>, begin: i64) -> Result<()> {
    if let Some(retain) = retain
        && retain > 0
        && begin > 0
        && retain <= begin
    {
        return Err(Error::config(
            "retain",
            format!("retain ({retain} days) must exceed begin ({begin} days)"),
        ));
    }
    Ok(())
}

/// Compute the retention cutoff for a washer's item collection.
///
/// Items with `created` older than the returned instant are deleted after a
/// save. `None` means nothing is ever deleted.
pub(crate) fn retain_cutoff(retain: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match retain {
        Some(0) => None,
        Some(days) if days > 0 => Some(now - ChronoDuration::days(days)),
        // Unset or negative: items expire as soon as they age past "now"
        _ => Some(now),
    }
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass() {
        for id in ["a", "mixcloud-liked", "feed.1", "A_b-c.d", "0day"] {
            assert!(validate_id(id).is_ok(), "id '{id}' should be valid");
        }
    }

    #[test]
    fn empty_id_fails() {
        assert!(validate_id("").is_err());
    }

    #[test]
    fn ids_with_bad_characters_fail() {
        for id in ["has space", "slash/y", "-leading", ".leading", "emoji🧺"] {
            assert!(validate_id(id).is_err(), "id '{id}' should be rejected");
        }
    }

    #[test]
    fn reserved_prefix_fails() {
        assert!(validate_id("log").is_err());
        assert!(validate_id("log-reader").is_err());
        // 'blog' does not start with the reserved prefix
        assert!(validate_id("blog").is_ok());
    }

    #[test]
    fn empty_subscribe_fails() {
        let err = validate_subscribe("a", &[]).unwrap_err();
        assert!(err.to_string().contains("missing subscribe"));
    }

    #[test]
    fn self_subscription_fails() {
        let err = validate_subscribe("a", &["a".to_string()]).unwrap_err();
        assert!(err.to_string().contains("can't subscribe to itself"));
    }

    #[test]
    fn retain_must_exceed_begin_when_both_set() {
        assert!(validate_retain_begin(Some(7), 3).is_ok());
        assert!(validate_retain_begin(Some(3), 7).is_err());
        assert!(validate_retain_begin(Some(3), 3).is_err());
        // retain=0 means forever, which always outlasts any back-fill
        assert!(validate_retain_begin(Some(0), 30).is_ok());
        // either side unconfigured skips the check
        assert!(validate_retain_begin(None, 30).is_ok());
        assert!(validate_retain_begin(Some(3), 0).is_ok());
    }

    #[test]
    fn schedule_expressions_validate() {
        assert!(validate_schedule("0 0 * * * *").is_ok());
        assert!(validate_schedule("not a cron").is_err());
    }

    #[test]
    fn retain_cutoff_semantics() {
        let now = Utc::now();
        assert!(retain_cutoff(Some(0), now).is_none(), "0 keeps forever");
        assert_eq!(
            retain_cutoff(Some(7), now),
            Some(now - ChronoDuration::days(7))
        );
        assert_eq!(retain_cutoff(None, now), Some(now), "unset expires at now");
        assert_eq!(
            retain_cutoff(Some(-1), now),
            Some(now),
            "negative behaves like unset"
        );
    }

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.storage.temp_dir, PathBuf::from("./cache/downloads"));
        assert_eq!(config.storage.content_dir, PathBuf::from("./files"));
        assert!(config.tools.search_path);
        assert_eq!(config.http.timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn wash_config_deserializes_with_defaults() {
        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "mixcloud-liked",
            "schedule": "0 0 * * * *",
        }))
        .unwrap();
        assert!(config.enabled);
        assert!(config.memory);
        assert_eq!(config.begin, 0);
        assert_eq!(config.retain, None);
        assert!(!config.download);
        assert_eq!(config.download_pool, 4);
    }
}
