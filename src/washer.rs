//! Washers: configured processing units.
//!
//! A [`Washer`] pairs a kind-specific configuration with a user-supplied job
//! implementation behind one of the job traits. The engine's free services
//! (scheduler, subscription engine, queue manager) operate on washers
//! through the accessors here; there is no behavioral inheritance, only the
//! kind tag and an exhaustive match wherever behavior differs.
//!
//! The four kinds:
//! - **Wash** — retrieve data on a schedule and parse it into normalized items
//! - **Rinse** — consume subscribed items, emit transformed items
//! - **Dry** — consume subscribed items, emit nothing
//! - **Fix** — scheduled maintenance, no item flow

use crate::config::{
    self, DryConfig, FixConfig, LOG_COLLECTION, RinseConfig, WashConfig,
};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::item::Item;
use crate::log::LogSource;
use crate::queue::QueueManager;
use crate::retry::FailedAttemptHook;
use crate::store::Memory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The four washer kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WasherKind {
    /// Source: produces items on a schedule.
    Wash,
    /// Transform: consumes subscribed items, emits transformed items.
    Rinse,
    /// Sink: consumes subscribed items, emits none.
    Dry,
    /// Maintenance: schedule-driven, no item flow.
    Fix,
}

impl WasherKind {
    /// The lowercase tag used in log record URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WasherKind::Wash => "wash",
            WasherKind::Rinse => "rinse",
            WasherKind::Dry => "dry",
            WasherKind::Fix => "fix",
        }
    }
}

impl fmt::Display for WasherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run services handed to job implementations.
///
/// Jobs reach external services through the context so that outbound
/// requests share the washer group's bounded queues, and keep incremental
/// state in [`Memory::state`](crate::store::Memory).
pub struct WasherContext<'a> {
    id: &'a str,
    name: &'a str,
    group: &'a str,
    /// The washer's memory for this run. Mutations persist when the run
    /// completes successfully (unless the washer opted out).
    pub memory: &'a mut Memory,
    queues: &'a QueueManager,
}

impl<'a> WasherContext<'a> {
    pub(crate) fn new(
        id: &'a str,
        name: &'a str,
        group: &'a str,
        memory: &'a mut Memory,
        queues: &'a QueueManager,
    ) -> Self {
        WasherContext {
            id,
            name,
            group,
            memory,
            queues,
        }
    }

    /// The washer instance id.
    pub fn washer_id(&self) -> &str {
        self.id
    }

    /// The washer family name.
    pub fn washer_name(&self) -> &str {
        self.name
    }

    /// Build a minimal item attributed to this washer.
    pub fn item(&self, url: impl Into<String>, created: DateTime<Utc>) -> Result<Item> {
        Item::new(url, created, self.id, self.name)
    }

    /// The shared HTTP client, for building requests.
    pub fn http_client(&self) -> &reqwest::Client {
        self.queues.client()
    }

    /// Submit an HTTP request through this washer's group queue with bounded
    /// retry. See [`QueueManager::queue_http`].
    pub async fn queue_http(
        &self,
        request: reqwest::Request,
        retries: u32,
        on_failed_attempt: Option<FailedAttemptHook<'_, Error>>,
    ) -> Result<reqwest::Response> {
        self.queues
            .queue_http(self.group, None, request, retries, on_failed_attempt)
            .await
    }

    /// Like [`Self::queue_http`] but on an explicitly named queue.
    pub async fn queue_http_named(
        &self,
        queue_name: &str,
        request: reqwest::Request,
        retries: u32,
        on_failed_attempt: Option<FailedAttemptHook<'_, Error>>,
    ) -> Result<reqwest::Response> {
        self.queues
            .queue_http(self.group, Some(queue_name), request, retries, on_failed_attempt)
            .await
    }

    /// Run arbitrary bounded work on this washer's group queue.
    pub async fn queue_task<T>(&self, task: impl std::future::Future<Output = T>) -> T {
        self.queues.queue_task(self.group, None, task).await
    }
}

/// A source job: produce new items, no input.
#[async_trait]
pub trait WashJob: Send + Sync {
    /// Retrieve and normalize new items.
    async fn run(&self, ctx: &mut WasherContext<'_>) -> Result<Vec<Item>>;
}

/// A transform job: consume subscribed items, emit transformed items.
#[async_trait]
pub trait RinseJob: Send + Sync {
    /// A filter applied to every instance of this job, AND-merged with the
    /// instance-configured filter.
    fn default_filter(&self) -> Option<Filter> {
        None
    }

    /// Transform the input batch.
    async fn run(&self, ctx: &mut WasherContext<'_>, items: Vec<Item>) -> Result<Vec<Item>>;
}

/// A sink job: consume subscribed items, emit nothing.
#[async_trait]
pub trait DryJob: Send + Sync {
    /// A filter applied to every instance of this job, AND-merged with the
    /// instance-configured filter.
    fn default_filter(&self) -> Option<Filter> {
        None
    }

    /// Act on the input batch.
    async fn run(&self, ctx: &mut WasherContext<'_>, items: Vec<Item>) -> Result<()>;
}

/// A maintenance job: schedule-driven, no item flow.
#[async_trait]
pub trait FixJob: Send + Sync {
    /// Perform maintenance.
    async fn run(&self, ctx: &mut WasherContext<'_>) -> Result<()>;
}

/// Kind tag plus the kind's config and job, matched exhaustively wherever
/// behavior differs.
pub(crate) enum KindSpec {
    Wash {
        config: WashConfig,
        job: Arc<dyn WashJob>,
    },
    Rinse {
        config: RinseConfig,
        job: Arc<dyn RinseJob>,
    },
    Dry {
        config: DryConfig,
        job: Arc<dyn DryJob>,
    },
    Fix {
        config: FixConfig,
        job: Arc<dyn FixJob>,
    },
}

/// A configured processing unit.
pub struct Washer {
    name: String,
    spec: KindSpec,
    running: AtomicBool,
    paused: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Washer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Washer")
            .field("name", &self.name)
            .field("running", &self.running)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Washer {
    fn assemble(name: impl Into<String>, spec: KindSpec) -> Self {
        Washer {
            name: name.into(),
            spec,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Construct a Wash washer.
    ///
    /// `name` is the family name, conventionally `service/task`; the portion
    /// before the first `/` keys the washer's concurrency group.
    pub fn wash(
        name: impl Into<String>,
        washer_config: WashConfig,
        job: Arc<dyn WashJob>,
    ) -> Result<Self> {
        config::validate_id(&washer_config.id)?;
        config::validate_schedule(&washer_config.schedule)?;
        config::validate_retain_begin(washer_config.retain, washer_config.begin)?;
        Ok(Self::assemble(
            name,
            KindSpec::Wash {
                config: washer_config,
                job,
            },
        ))
    }

    /// Construct a Rinse washer.
    pub fn rinse(
        name: impl Into<String>,
        washer_config: RinseConfig,
        job: Arc<dyn RinseJob>,
    ) -> Result<Self> {
        config::validate_id(&washer_config.id)?;
        if let Some(schedule) = &washer_config.schedule {
            config::validate_schedule(schedule)?;
        }
        config::validate_subscribe(&washer_config.id, &washer_config.subscribe)?;
        config::validate_retain_begin(washer_config.retain, washer_config.begin)?;
        Ok(Self::assemble(
            name,
            KindSpec::Rinse {
                config: washer_config,
                job,
            },
        ))
    }

    /// Construct a Dry washer.
    pub fn dry(
        name: impl Into<String>,
        washer_config: DryConfig,
        job: Arc<dyn DryJob>,
    ) -> Result<Self> {
        config::validate_id(&washer_config.id)?;
        if let Some(schedule) = &washer_config.schedule {
            config::validate_schedule(schedule)?;
        }
        config::validate_subscribe(&washer_config.id, &washer_config.subscribe)?;
        Ok(Self::assemble(
            name,
            KindSpec::Dry {
                config: washer_config,
                job,
            },
        ))
    }

    /// Construct a Fix washer.
    pub fn fix(
        name: impl Into<String>,
        washer_config: FixConfig,
        job: Arc<dyn FixJob>,
    ) -> Result<Self> {
        config::validate_id(&washer_config.id)?;
        config::validate_schedule(&washer_config.schedule)?;
        Ok(Self::assemble(
            name,
            KindSpec::Fix {
                config: washer_config,
                job,
            },
        ))
    }

    /// The washer instance id.
    pub fn id(&self) -> &str {
        match &self.spec {
            KindSpec::Wash { config, .. } => &config.id,
            KindSpec::Rinse { config, .. } => &config.id,
            KindSpec::Dry { config, .. } => &config.id,
            KindSpec::Fix { config, .. } => &config.id,
        }
    }

    /// The washer family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concurrency group: the family name up to its first `/`.
    pub fn group(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }

    /// This washer's kind tag.
    pub fn kind(&self) -> WasherKind {
        match &self.spec {
            KindSpec::Wash { .. } => WasherKind::Wash,
            KindSpec::Rinse { .. } => WasherKind::Rinse,
            KindSpec::Dry { .. } => WasherKind::Dry,
            KindSpec::Fix { .. } => WasherKind::Fix,
        }
    }

    /// Whether this washer runs at all.
    pub fn enabled(&self) -> bool {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.enabled,
            KindSpec::Rinse { config, .. } => config.enabled,
            KindSpec::Dry { config, .. } => config.enabled,
            KindSpec::Fix { config, .. } => config.enabled,
        }
    }

    /// Whether memory is persisted at the end of successful runs.
    pub fn persist_memory(&self) -> bool {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.memory,
            KindSpec::Rinse { config, .. } => config.memory,
            KindSpec::Dry { config, .. } => config.memory,
            KindSpec::Fix { config, .. } => config.memory,
        }
    }

    /// The schedule expression, if this washer is schedule-driven.
    pub fn schedule(&self) -> Option<&str> {
        match &self.spec {
            KindSpec::Wash { config, .. } => Some(&config.schedule),
            KindSpec::Rinse { config, .. } => config.schedule.as_deref(),
            KindSpec::Dry { config, .. } => config.schedule.as_deref(),
            KindSpec::Fix { config, .. } => Some(&config.schedule),
        }
    }

    /// Subscribed source ids. Empty for Wash and Fix.
    pub fn subscribe(&self) -> &[String] {
        match &self.spec {
            KindSpec::Rinse { config, .. } => &config.subscribe,
            KindSpec::Dry { config, .. } => &config.subscribe,
            _ => &[],
        }
    }

    /// Days of back-fill on the first run.
    pub fn begin(&self) -> i64 {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.begin,
            KindSpec::Rinse { config, .. } => config.begin,
            _ => 0,
        }
    }

    /// Item retention in days. Only meaningful for item-producing kinds.
    pub fn retain(&self) -> Option<i64> {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.retain,
            KindSpec::Rinse { config, .. } => config.retain,
            _ => Some(0),
        }
    }

    /// Whether attached downloads are resolved for this washer's output.
    pub fn download(&self) -> bool {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.download,
            KindSpec::Rinse { config, .. } => config.download,
            _ => false,
        }
    }

    /// Download concurrency for this washer's group.
    pub fn download_pool(&self) -> usize {
        match &self.spec {
            KindSpec::Wash { config, .. } => config.download_pool,
            KindSpec::Rinse { config, .. } => config.download_pool,
            _ => 1,
        }
    }

    /// Whether this washer's output feeds other washers.
    pub fn produces_items(&self) -> bool {
        matches!(
            self.spec,
            KindSpec::Wash { .. } | KindSpec::Rinse { .. }
        )
    }

    /// Whether this washer consumes the reserved log collection.
    pub fn subscribes_to_log(&self) -> bool {
        self.subscribe().iter().any(|s| s == LOG_COLLECTION)
    }

    /// The merged filter for subscription delivery: the job's default filter
    /// AND the instance-configured filter.
    pub(crate) fn merged_filter(&self) -> Option<Filter> {
        match &self.spec {
            KindSpec::Rinse { config, job } => {
                Filter::and(job.default_filter().as_ref(), config.filter.as_ref())
            }
            KindSpec::Dry { config, job } => {
                Filter::and(job.default_filter().as_ref(), config.filter.as_ref())
            }
            _ => None,
        }
    }

    /// Stop scheduling runs for this washer without removing it.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume a paused washer.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether this washer is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the running flag. Returns false if a run is already active.
    pub(crate) fn begin_run(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Release the running flag.
    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Lock serializing push-delivered runs for this washer.
    pub(crate) fn run_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.run_lock
    }

    /// Log attribution for this washer, including its logger exemption.
    pub(crate) fn log_source(&self) -> LogSource {
        LogSource {
            kind: self.kind().as_str(),
            name: self.name.clone(),
            id: self.id().to_string(),
            exempt: matches!(
                self.kind(),
                WasherKind::Rinse | WasherKind::Dry
            ) && self.subscribes_to_log(),
        }
    }

    /// Serialize this washer's configuration for the memory snapshot.
    pub(crate) fn config_snapshot(&self) -> Value {
        let snapshot = match &self.spec {
            KindSpec::Wash { config, .. } => serde_json::to_value(config),
            KindSpec::Rinse { config, .. } => serde_json::to_value(config),
            KindSpec::Dry { config, .. } => serde_json::to_value(config),
            KindSpec::Fix { config, .. } => serde_json::to_value(config),
        };
        snapshot.unwrap_or(Value::Null)
    }

    pub(crate) fn spec(&self) -> &KindSpec {
        &self.spec
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct NullWash;

    #[async_trait]
    impl WashJob for NullWash {
        async fn run(&self, _ctx: &mut WasherContext<'_>) -> Result<Vec<Item>> {
            Ok(Vec::new())
        }
    }

    struct NullDry;

    #[async_trait]
    impl DryJob for NullDry {
        async fn run(&self, _ctx: &mut WasherContext<'_>, _items: Vec<Item>) -> Result<()> {
            Ok(())
        }
    }

    fn wash_config(id: &str) -> WashConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "schedule": "0 0 * * * *",
        }))
        .unwrap()
    }

    fn dry_config(id: &str, subscribe: &[&str]) -> DryConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "subscribe": subscribe,
        }))
        .unwrap()
    }

    #[test]
    fn wash_construction_validates_schedule() {
        let mut config = wash_config("a");
        config.schedule = "not a cron".to_string();
        assert!(Washer::wash("test/wash", config, Arc::new(NullWash)).is_err());
    }

    #[test]
    fn self_subscription_fails_construction() {
        let config = dry_config("a", &["a"]);
        let err = Washer::dry("test/dry", config, Arc::new(NullDry)).unwrap_err();
        assert!(err.to_string().contains("can't subscribe to itself"));
    }

    #[test]
    fn empty_subscription_fails_construction() {
        let config = dry_config("a", &[]);
        let err = Washer::dry("test/dry", config, Arc::new(NullDry)).unwrap_err();
        assert!(err.to_string().contains("missing subscribe"));
    }

    #[test]
    fn retain_not_exceeding_begin_fails_construction() {
        let mut config = wash_config("a");
        config.retain = Some(3);
        config.begin = 7;
        assert!(Washer::wash("test/wash", config, Arc::new(NullWash)).is_err());
    }

    #[test]
    fn group_is_family_name_prefix() {
        let washer = Washer::wash("mixcloud/liked", wash_config("a"), Arc::new(NullWash)).unwrap();
        assert_eq!(washer.group(), "mixcloud");

        let washer = Washer::wash("standalone", wash_config("b"), Arc::new(NullWash)).unwrap();
        assert_eq!(washer.group(), "standalone");
    }

    #[test]
    fn log_subscriber_is_exempt_from_logging() {
        let washer =
            Washer::dry("test/dry", dry_config("a", &["log"]), Arc::new(NullDry)).unwrap();
        assert!(washer.subscribes_to_log());
        assert!(washer.log_source().exempt);

        let washer =
            Washer::dry("test/dry", dry_config("b", &["src"]), Arc::new(NullDry)).unwrap();
        assert!(!washer.log_source().exempt);
    }

    #[test]
    fn running_flag_claims_exclusively() {
        let washer = Washer::wash("test/wash", wash_config("a"), Arc::new(NullWash)).unwrap();
        assert!(washer.begin_run(), "first claim succeeds");
        assert!(!washer.begin_run(), "second claim fails while running");
        washer.end_run();
        assert!(washer.begin_run(), "claim succeeds again after release");
    }

    #[test]
    fn pause_and_resume_toggle() {
        let washer = Washer::wash("test/wash", wash_config("a"), Arc::new(NullWash)).unwrap();
        assert!(!washer.is_paused());
        washer.pause();
        assert!(washer.is_paused());
        washer.resume();
        assert!(!washer.is_paused());
    }
}
