//! The standard per-run sequence shared by every washer kind.
//!
//! A run, regardless of kind: guard checks, claim the running flag, load
//! memory, start event, the kind-specific job, validation and ordering,
//! download resolution, persistence, memory write, temp cleanup, complete
//! event. Errors anywhere inside are caught at the run boundary, logged as
//! an error event, and leave the watermark untouched so the same window is
//! retried on the next trigger.

use super::EngineInner;
use super::subscriptions;
use crate::config;
use crate::download::DownloadResult;
use crate::item::{Enclosure, Item};
use crate::log::LogMessage;
use crate::store::Memory;
use crate::washer::{KindSpec, Washer, WasherContext, WasherKind};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// What caused a run.
pub(crate) enum Trigger {
    /// A scheduled tick. Rinse/Dry washers poll their subscriptions.
    Schedule,
    /// One item delivered by a real-time subscription.
    Push(Item),
}

impl EngineInner {
    /// A scheduled tick. Skipped entirely while the washer is running or
    /// paused; missed ticks are never queued.
    pub(crate) async fn tick(&self, washer: &Arc<Washer>) {
        if !washer.enabled() {
            return;
        }
        if washer.is_running() || washer.is_paused() {
            tracing::debug!(washer = %washer.id(), "Skipping tick, washer busy or paused");
            return;
        }
        self.run(washer, Trigger::Schedule).await;
    }

    /// A push-delivered item. Runs serialize on the washer's lock rather
    /// than dropping items; paused washers drop them.
    pub(crate) async fn push(&self, washer: &Arc<Washer>, item: Item) {
        if !washer.enabled() {
            return;
        }
        if washer.is_paused() {
            tracing::debug!(washer = %washer.id(), url = %item.url, "Washer paused, dropping pushed item");
            return;
        }
        let _guard = washer.run_lock().lock().await;
        self.run(washer, Trigger::Push(item)).await;
    }

    async fn run(&self, washer: &Arc<Washer>, trigger: Trigger) {
        if !washer.begin_run() {
            tracing::debug!(washer = %washer.id(), "Run already active");
            return;
        }

        let outcome = self.execute(washer, trigger).await;
        if let Err(e) = outcome {
            self.journal
                .error(&washer.log_source(), LogMessage::from_error(&e))
                .await;
        }

        washer.end_run();
    }

    async fn execute(&self, washer: &Arc<Washer>, trigger: Trigger) -> crate::error::Result<()> {
        let started = Utc::now();

        let mut memory = self
            .store
            .load_memory(washer.id())
            .await?
            .unwrap_or_else(|| Memory::first_run(washer.begin()));

        let input = match trigger {
            Trigger::Push(item) => Some(vec![item]),
            Trigger::Schedule => match washer.kind() {
                WasherKind::Rinse | WasherKind::Dry => Some(
                    subscriptions::load_subscriptions(self, washer, memory.last_run).await?,
                ),
                WasherKind::Wash | WasherKind::Fix => None,
            },
        };

        // An idle poll is not a run: no events, no watermark movement
        if let Some(items) = &input
            && items.is_empty()
        {
            return Ok(());
        }

        let source = washer.log_source();
        self.journal.info(&source, LogMessage::text("start")).await;

        match washer.spec() {
            KindSpec::Wash { job, .. } => {
                let mut ctx = WasherContext::new(
                    washer.id(),
                    washer.name(),
                    washer.group(),
                    &mut memory,
                    &self.queues,
                );
                let output = job.run(&mut ctx).await?;
                self.persist_output(washer, output).await?;
            }
            KindSpec::Rinse { job, .. } => {
                let mut ctx = WasherContext::new(
                    washer.id(),
                    washer.name(),
                    washer.group(),
                    &mut memory,
                    &self.queues,
                );
                let output = job.run(&mut ctx, input.unwrap_or_default()).await?;
                self.persist_output(washer, output).await?;
            }
            KindSpec::Dry { job, .. } => {
                let mut ctx = WasherContext::new(
                    washer.id(),
                    washer.name(),
                    washer.group(),
                    &mut memory,
                    &self.queues,
                );
                job.run(&mut ctx, input.unwrap_or_default()).await?;
            }
            KindSpec::Fix { job, .. } => {
                let mut ctx = WasherContext::new(
                    washer.id(),
                    washer.name(),
                    washer.group(),
                    &mut memory,
                    &self.queues,
                );
                job.run(&mut ctx).await?;
            }
        }

        if washer.persist_memory() {
            // The watermark is the run start, so items saved by sources
            // while this run was in flight are re-polled next time
            memory.last_run = started;
            memory.last_duration = Some((Utc::now() - started).num_milliseconds());
            memory.config = washer.config_snapshot();
            self.store.save_memory(washer.id(), &memory).await?;
        }

        if let Err(e) = self.fetcher.clean().await {
            tracing::warn!(washer = %washer.id(), error = %e, "Temp cleanup failed");
        }

        self.journal
            .info(
                &source,
                LogMessage::text("complete").with(
                    "duration_ms",
                    Value::from((Utc::now() - started).num_milliseconds()),
                ),
            )
            .await;

        Ok(())
    }

    /// Validate, order, resolve downloads for, and persist a washer's output.
    async fn persist_output(
        &self,
        washer: &Arc<Washer>,
        items: Vec<Item>,
    ) -> crate::error::Result<()> {
        let items = self.check_items(washer, items).await;
        let items = self.download_items(washer, items).await;
        if items.is_empty() {
            return Ok(());
        }
        let cutoff = config::retain_cutoff(washer.retain(), Utc::now());
        self.store.save_items(washer.id(), &items, cutoff).await
    }

    /// Partition out items without a valid `created` timestamp (logging
    /// their URLs as one error event) and sort the rest newest first.
    ///
    /// The newest-first ordering is a contract downstream consumers may
    /// rely on.
    pub(crate) async fn check_items(&self, washer: &Washer, items: Vec<Item>) -> Vec<Item> {
        if items.is_empty() {
            return items;
        }

        let (mut valid, invalid): (Vec<Item>, Vec<Item>) =
            items.into_iter().partition(|i| i.created.is_some());

        if !invalid.is_empty() {
            let urls: Vec<Value> = invalid
                .iter()
                .map(|i| Value::String(i.url.clone()))
                .collect();
            self.journal
                .error(
                    &washer.log_source(),
                    LogMessage::text("invalid created dates").with("urls", Value::Array(urls)),
                )
                .await;
        }

        valid.sort_by(|a, b| b.created.cmp(&a.created));
        valid
    }

    /// Resolve every pending download attached to the batch.
    ///
    /// Cached targets merge without a fetch; everything else goes through
    /// the washer's download queue. A download that fails after its retry
    /// budget drops only the owning item; sibling items are unaffected.
    pub(crate) async fn download_items(&self, washer: &Washer, mut items: Vec<Item>) -> Vec<Item> {
        if !washer.download() || items.is_empty() {
            return items;
        }

        let jobs: Vec<(usize, crate::download::Download)> = items
            .iter()
            .enumerate()
            .flat_map(|(index, item)| {
                item.downloads.iter().cloned().map(move |d| (index, d))
            })
            .collect();

        if jobs.is_empty() {
            return items;
        }

        let group = washer.group();
        let pool = washer.download_pool();

        let outcomes = futures::future::join_all(jobs.into_iter().map(|(index, download)| {
            async move {
                if let Some(cached) = self.content.existing(&download).await {
                    return (index, download, Ok(cached));
                }
                let outcome = self
                    .queues
                    .queue_download(group, pool, self.fetcher.fetch(&download))
                    .await;
                (index, download, outcome)
            }
        }))
        .await;

        let mut failed: HashSet<usize> = HashSet::new();
        for (index, download, outcome) in outcomes {
            match outcome {
                Ok(result) => apply_result(&mut items[index], result),
                Err(e) => {
                    self.journal
                        .warn(
                            &washer.log_source(),
                            LogMessage::text("download failed")
                                .with("url", Value::String(download.url))
                                .with("error", Value::String(e.to_string())),
                        )
                        .await;
                    failed.insert(index);
                }
            }
        }

        let mut index = 0;
        items.retain(|_| {
            let keep = !failed.contains(&index);
            index += 1;
            keep
        });
        for item in &mut items {
            item.downloads.clear();
        }
        items
    }
}

/// Merge a finished download back into its owning item.
fn apply_result(item: &mut Item, result: DownloadResult) {
    if let Some(media) = &result.media {
        item.media = Some(Enclosure {
            file: result.dir.join(media).display().to_string(),
            size: result.size.unwrap_or(0),
            mime: result
                .mime
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        });
    }
    if item.image.is_none()
        && let Some(image) = &result.image
    {
        item.image = Some(result.dir.join(image).display().to_string());
    }
    if let Some(data) = result.data {
        item.meta.insert("media".to_string(), data);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, WashConfig};
    use crate::download::Download;
    use crate::engine::Laundromat;
    use crate::error::{DownloadError, Error, Result};
    use crate::fetch::MediaFetcher;
    use crate::fetch::content::ContentStore;
    use crate::log::LogLevel;
    use crate::store::memory::MemoryStore;
    use crate::store::StateStore;
    use crate::washer::WashJob;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fetcher that succeeds or fails by URL substring, counting calls.
    struct ScriptedFetcher {
        fail_containing: &'static str,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(fail_containing: &'static str) -> Self {
            ScriptedFetcher {
                fail_containing,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn fetch(&self, download: &Download) -> Result<DownloadResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.fail_containing.is_empty() && download.url.contains(self.fail_containing) {
                return Err(Error::Download(DownloadError::Failed {
                    url: download.url.clone(),
                    reason: "scripted failure".to_string(),
                }));
            }
            Ok(DownloadResult {
                url: download.url.clone(),
                dir: PathBuf::from("/files/entry"),
                media: Some("media.mp3".to_string()),
                size: Some(1),
                mime: Some("audio/mpeg".to_string()),
                ..DownloadResult::default()
            })
        }

        async fn clean(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Content store with no entries that accepts everything.
    struct EmptyContent;

    #[async_trait]
    impl ContentStore for EmptyContent {
        async fn existing(&self, _download: &Download) -> Option<DownloadResult> {
            None
        }
        async fn store(&self, result: DownloadResult, _temp_dir: &Path) -> Result<DownloadResult> {
            Ok(result)
        }
    }

    /// Content store that answers every lookup from cache.
    struct AlwaysCachedContent;

    #[async_trait]
    impl ContentStore for AlwaysCachedContent {
        async fn existing(&self, download: &Download) -> Option<DownloadResult> {
            Some(DownloadResult {
                url: download.url.clone(),
                dir: PathBuf::from("/files/cached"),
                media: Some("media.mp3".to_string()),
                size: Some(7),
                mime: Some("audio/mpeg".to_string()),
                ..DownloadResult::default()
            })
        }
        async fn store(&self, result: DownloadResult, _temp_dir: &Path) -> Result<DownloadResult> {
            Ok(result)
        }
    }

    struct CountingWash {
        runs: Arc<AtomicU32>,
        delay: Duration,
    }

    #[async_trait]
    impl WashJob for CountingWash {
        async fn run(&self, _ctx: &mut WasherContext<'_>) -> Result<Vec<Item>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    fn test_config(root: &Path) -> EngineConfig {
        EngineConfig {
            storage: crate::config::StorageConfig {
                temp_dir: root.join("temp"),
                content_dir: root.join("files"),
            },
            ..EngineConfig::default()
        }
    }

    async fn engine_with(
        root: &Path,
        store: Arc<MemoryStore>,
        content: Arc<dyn ContentStore>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Laundromat {
        Laundromat::with_components(test_config(root), store, content, fetcher)
            .await
            .unwrap()
    }

    fn download_washer(id: &str) -> Washer {
        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": id,
            "schedule": "0 0 * * * *",
            "download": true,
        }))
        .unwrap();
        Washer::wash(
            "test/wash",
            config,
            Arc::new(CountingWash {
                runs: Arc::new(AtomicU32::new(0)),
                delay: Duration::ZERO,
            }),
        )
        .unwrap()
    }

    fn item_with_download(url: &str, target: &str) -> Item {
        let mut item = Item::new(url, Utc::now(), "a", "test/wash").unwrap();
        item.downloads.push(Download::direct(target));
        item
    }

    #[tokio::test]
    async fn check_items_filters_invalid_and_sorts_newest_first() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(
            root.path(),
            store.clone(),
            Arc::new(EmptyContent),
            Arc::new(ScriptedFetcher::new("")),
        )
        .await;
        let washer = download_washer("a");

        let jan_first = Item::from_document(serde_json::json!({
            "url": "https://e.com/jan-1",
            "created": "2020-01-01T00:00:00Z",
        }))
        .unwrap();
        let jan_third = Item::from_document(serde_json::json!({
            "url": "https://e.com/jan-3",
            "created": "2020-01-03T00:00:00Z",
        }))
        .unwrap();
        let missing = Item::from_document(serde_json::json!({
            "url": "https://e.com/missing",
            "created": null,
        }))
        .unwrap();
        let garbage = Item::from_document(serde_json::json!({
            "url": "https://e.com/garbage",
            "created": "not-a-date",
        }))
        .unwrap();

        let checked = engine
            .inner
            .check_items(&washer, vec![missing, garbage, jan_first, jan_third])
            .await;

        let urls: Vec<&str> = checked.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["https://e.com/jan-3", "https://e.com/jan-1"]);

        let entries = store.log_entries().await;
        assert_eq!(entries.len(), 1, "one error event for the batch");
        let (level, record) = &entries[0];
        assert_eq!(*level, LogLevel::Error);
        let logged_urls = record.meta.get("urls").and_then(|v| v.as_array()).unwrap();
        assert_eq!(logged_urls.len(), 2);
        assert!(logged_urls.iter().any(|u| u == "https://e.com/missing"));
        assert!(logged_urls.iter().any(|u| u == "https://e.com/garbage"));
    }

    #[tokio::test]
    async fn failed_download_drops_only_the_owning_item() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new("bad"));
        let engine = engine_with(
            root.path(),
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyContent),
            fetcher.clone(),
        )
        .await;
        let washer = download_washer("a");

        let items = vec![
            item_with_download("https://e.com/1", "https://cdn.e.com/good.mp3"),
            item_with_download("https://e.com/2", "https://cdn.e.com/bad.mp3"),
        ];

        let survivors = engine.inner.download_items(&washer, items).await;

        assert_eq!(survivors.len(), 1, "only the item with the good download survives");
        assert_eq!(survivors[0].url, "https://e.com/1");
        assert!(survivors[0].media.is_some(), "result merged into the survivor");
        assert!(survivors[0].downloads.is_empty(), "pending list cleared");
    }

    #[tokio::test]
    async fn cached_results_merge_without_any_fetch() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(""));
        let engine = engine_with(
            root.path(),
            Arc::new(MemoryStore::new()),
            Arc::new(AlwaysCachedContent),
            fetcher.clone(),
        )
        .await;
        let washer = download_washer("a");

        let items = vec![item_with_download(
            "https://e.com/1",
            "https://cdn.e.com/track.mp3",
        )];
        let merged = engine.inner.download_items(&washer, items).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0, "no fetch attempt");
        assert_eq!(merged.len(), 1);
        let enclosure = merged[0].media.as_ref().unwrap();
        assert_eq!(enclosure.size, 7);
        assert!(enclosure.file.ends_with("media.mp3"));
    }

    #[tokio::test]
    async fn download_disabled_leaves_batch_untouched() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(""));
        let engine = engine_with(
            root.path(),
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyContent),
            fetcher.clone(),
        )
        .await;

        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "a",
            "schedule": "0 0 * * * *",
        }))
        .unwrap();
        let washer = Washer::wash(
            "test/wash",
            config,
            Arc::new(CountingWash {
                runs: Arc::new(AtomicU32::new(0)),
                delay: Duration::ZERO,
            }),
        )
        .unwrap();

        let items = vec![item_with_download("https://e.com/1", "https://cdn.e.com/a.mp3")];
        let out = engine.inner.download_items(&washer, items).await;
        assert_eq!(out.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_tick_is_a_no_op_while_running() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_with(
            root.path(),
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyContent),
            Arc::new(ScriptedFetcher::new("")),
        )
        .await;

        let runs = Arc::new(AtomicU32::new(0));
        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "slow",
            "schedule": "0 0 * * * *",
        }))
        .unwrap();
        engine
            .add_washer(
                Washer::wash(
                    "test/wash",
                    config,
                    Arc::new(CountingWash {
                        runs: runs.clone(),
                        delay: Duration::from_millis(200),
                    }),
                )
                .unwrap(),
            )
            .unwrap();

        let washer = engine.washer("slow").unwrap();
        let inner = engine.inner.clone();

        // Second tick fires while the first is mid-run
        tokio::join!(inner.tick(&washer), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            inner.tick(&washer).await;
        });

        assert_eq!(
            runs.load(Ordering::SeqCst),
            1,
            "overlapping tick must be skipped, not queued"
        );
    }

    #[tokio::test]
    async fn paused_washer_skips_ticks() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_with(
            root.path(),
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyContent),
            Arc::new(ScriptedFetcher::new("")),
        )
        .await;

        let runs = Arc::new(AtomicU32::new(0));
        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "pausable",
            "schedule": "0 0 * * * *",
        }))
        .unwrap();
        engine
            .add_washer(
                Washer::wash(
                    "test/wash",
                    config,
                    Arc::new(CountingWash {
                        runs: runs.clone(),
                        delay: Duration::ZERO,
                    }),
                )
                .unwrap(),
            )
            .unwrap();

        let washer = engine.washer("pausable").unwrap();
        washer.pause();
        engine.inner.tick(&washer).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        washer.resume();
        engine.inner.tick(&washer).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_run_does_not_advance_the_watermark() {
        struct FailingWash;

        #[async_trait]
        impl WashJob for FailingWash {
            async fn run(&self, _ctx: &mut WasherContext<'_>) -> Result<Vec<Item>> {
                Err(Error::Other("source exploded".to_string()))
            }
        }

        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(
            root.path(),
            store.clone(),
            Arc::new(EmptyContent),
            Arc::new(ScriptedFetcher::new("")),
        )
        .await;

        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "failing",
            "schedule": "0 0 * * * *",
        }))
        .unwrap();
        engine
            .add_washer(Washer::wash("test/wash", config, Arc::new(FailingWash)).unwrap())
            .unwrap();

        let washer = engine.washer("failing").unwrap();
        engine.inner.tick(&washer).await;

        assert!(
            store.load_memory("failing").await.unwrap().is_none(),
            "failed runs must not persist memory"
        );
        let entries = store.log_entries().await;
        assert!(
            entries
                .iter()
                .any(|(level, record)| *level == LogLevel::Error
                    && record.meta.get("error").is_some()),
            "the failure is logged as an error event"
        );
        assert!(
            !washer.is_running(),
            "the running flag is released after a failed run"
        );
    }

    #[tokio::test]
    async fn successful_run_persists_memory_with_start_watermark() {
        struct OneItemWash;

        #[async_trait]
        impl WashJob for OneItemWash {
            async fn run(&self, ctx: &mut WasherContext<'_>) -> Result<Vec<Item>> {
                Ok(vec![ctx.item("https://e.com/1", Utc::now())?])
            }
        }

        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(
            root.path(),
            store.clone(),
            Arc::new(EmptyContent),
            Arc::new(ScriptedFetcher::new("")),
        )
        .await;

        let config: WashConfig = serde_json::from_value(serde_json::json!({
            "id": "ok",
            "schedule": "0 0 * * * *",
            "retain": 0,
        }))
        .unwrap();
        engine
            .add_washer(Washer::wash("test/wash", config, Arc::new(OneItemWash)).unwrap())
            .unwrap();

        let before = Utc::now();
        engine.run_once("ok").await.unwrap();

        let memory = store.load_memory("ok").await.unwrap().expect("memory saved");
        assert!(memory.last_run >= before, "watermark is the run start time");
        assert!(memory.last_duration.is_some());
        assert_eq!(
            memory.config.get("id").and_then(|v| v.as_str()),
            Some("ok"),
            "memory snapshots the config"
        );

        let saved = store.items_for("ok").await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].url, "https://e.com/1");
    }
}
