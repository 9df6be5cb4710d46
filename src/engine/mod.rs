//! The orchestration engine.
//!
//! [`Laundromat`] is the composition root: it owns the state store, the
//! queue manager, the downloader, and the washer registry, and drives every
//! washer through the scheduler and subscription engine. Submodules by
//! domain:
//! - [`lifecycle`] — the standard per-run sequence, validation, downloads
//! - [`scheduler`] — per-washer cron loops
//! - [`subscriptions`] — polling and real-time delivery

mod lifecycle;
mod scheduler;
mod subscriptions;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fetch::content::{ContentStore, FsContentStore};
use crate::fetch::{Downloader, MediaFetcher};
use crate::log::Journal;
use crate::queue::QueueManager;
use crate::store::StateStore;
use crate::washer::Washer;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared engine state behind the public handle.
pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) fetcher: Arc<dyn MediaFetcher>,
    pub(crate) queues: Arc<QueueManager>,
    pub(crate) journal: Journal,
    pub(crate) washers: std::sync::Mutex<Vec<Arc<Washer>>>,
    pub(crate) shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The orchestration engine (cloneable handle; all state is shared).
#[derive(Clone)]
pub struct Laundromat {
    pub(crate) inner: Arc<EngineInner>,
}

impl Laundromat {
    /// Create an engine with the bundled downloader and filesystem content
    /// store.
    pub async fn new(config: EngineConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let content: Arc<dyn ContentStore> =
            Arc::new(FsContentStore::new(config.storage.content_dir.clone()));
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout)
            .build()?;
        let fetcher: Arc<dyn MediaFetcher> =
            Arc::new(Downloader::new(&config, http, content.clone()));
        Self::with_components(config, store, content, fetcher).await
    }

    /// Create an engine with custom download components.
    ///
    /// This is the constructor for embedders that bring their own fetcher or
    /// content store (and for tests).
    pub async fn with_components(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        content: Arc<dyn ContentStore>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Result<Self> {
        store.init().await?;

        tokio::fs::create_dir_all(&config.storage.temp_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create temp directory '{}': {}",
                        config.storage.temp_dir.display(),
                        e
                    ),
                ))
            })?;
        tokio::fs::create_dir_all(&config.storage.content_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create content directory '{}': {}",
                        config.storage.content_dir.display(),
                        e
                    ),
                ))
            })?;

        let queues = Arc::new(QueueManager::new(&config)?);
        let journal = Journal::new(store.clone());

        Ok(Laundromat {
            inner: Arc::new(EngineInner {
                store,
                content,
                fetcher,
                queues,
                journal,
                washers: std::sync::Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register a washer. Ids must be unique across the engine.
    pub fn add_washer(&self, washer: Washer) -> Result<()> {
        let mut washers = self
            .inner
            .washers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if washers.iter().any(|w| w.id() == washer.id()) {
            return Err(Error::config(
                "id",
                format!("duplicate washer id '{}'", washer.id()),
            ));
        }
        washers.push(Arc::new(washer));
        Ok(())
    }

    /// Look up a registered washer, e.g. to pause or resume it.
    pub fn washer(&self, id: &str) -> Option<Arc<Washer>> {
        self.inner
            .washers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|w| w.id() == id)
            .cloned()
    }

    /// Wire subscriptions and start every washer's schedule or real-time
    /// pump.
    ///
    /// A washer whose subscriptions reference unknown sources fails wiring;
    /// the failure is logged and only that washer is dropped; the rest of
    /// the pipeline starts normally.
    pub async fn start(&self) -> Result<()> {
        let washers: Vec<Arc<Washer>> = self
            .inner
            .washers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let sources: HashSet<String> = washers
            .iter()
            .filter(|w| w.produces_items())
            .map(|w| w.id().to_string())
            .collect();

        let mut handles = Vec::new();
        let mut started = 0usize;
        for washer in &washers {
            if let Err(e) = subscriptions::validate_sources(washer, &sources) {
                tracing::error!(washer = %washer.id(), error = %e, "Washer failed wiring, skipping");
                self.inner
                    .journal
                    .error(
                        &washer.log_source(),
                        crate::log::LogMessage::from_error(&e),
                    )
                    .await;
                continue;
            }

            if washer.schedule().is_some() {
                handles.push(scheduler::spawn_schedule(
                    self.inner.clone(),
                    washer.clone(),
                ));
            } else {
                handles.extend(subscriptions::spawn_realtime(
                    self.inner.clone(),
                    washer.clone(),
                ));
            }
            started += 1;
        }

        self.inner.tasks.lock().await.extend(handles);
        tracing::info!(washers = started, "Laundromat started");
        Ok(())
    }

    /// Trigger one run of a washer immediately, bypassing its schedule but
    /// not its running/paused guard. Completes when the run does.
    pub async fn run_once(&self, id: &str) -> Result<()> {
        let washer = self
            .washer(id)
            .ok_or_else(|| Error::NotFound(format!("washer '{id}'")))?;
        self.inner.tick(&washer).await;
        Ok(())
    }

    /// Stop all schedules and subscription pumps and wait for them to exit.
    /// In-flight runs complete first.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.await.ok();
        }
        tracing::info!("Laundromat stopped");
        Ok(())
    }

    /// The engine's queue manager, for embedders that submit their own
    /// bounded work.
    pub fn queues(&self) -> Arc<QueueManager> {
        self.inner.queues.clone()
    }

    /// The engine's state store.
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    /// The engine's journal, for recording events alongside washer output.
    pub fn journal(&self) -> Journal {
        self.inner.journal.clone()
    }
}
