//! Bounded concurrency for outbound work.
//!
//! The [`QueueManager`] owns two registries of named queues keyed by a
//! washer's logical group (the family-name prefix before the first `/`):
//!
//! - **task queues** serialize outbound calls sharing a group (concurrency
//!   1), so requests against the same external API never run concurrently
//!   and shared rate limits survive;
//! - **download queues** bound media fetches per group at a configurable
//!   width.
//!
//! Queues are created lazily on first use and live for the process lifetime.
//! The manager is an explicit object owned by the engine and passed by
//! reference, never an ambient global, so tests get a fresh one each time.

use crate::config::{EngineConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::{FailedAttemptHook, retry_with_backoff};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Process-wide registries of named, bounded queues.
pub struct QueueManager {
    http: reqwest::Client,
    retry: RetryConfig,
    task_queues: Mutex<HashMap<String, Arc<Semaphore>>>,
    download_queues: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl QueueManager {
    /// Create a manager with the configured HTTP client and retry policy.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout)
            .build()?;

        Ok(QueueManager {
            http,
            retry: config.retry.clone(),
            task_queues: Mutex::new(HashMap::new()),
            download_queues: Mutex::new(HashMap::new()),
        })
    }

    /// The shared HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Fetch or lazily create a named queue. The first creation fixes the
    /// queue's concurrency for the process lifetime.
    fn named(
        registry: &Mutex<HashMap<String, Arc<Semaphore>>>,
        name: &str,
        concurrency: usize,
    ) -> Arc<Semaphore> {
        let mut queues = registry.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(concurrency.max(1))))
            .clone()
    }

    /// Run a task on the group's serial task queue.
    ///
    /// `queue_name` overrides the queue identity; by default tasks from the
    /// same group share one slot.
    pub async fn queue_task<T>(
        &self,
        group: &str,
        queue_name: Option<&str>,
        task: impl Future<Output = T>,
    ) -> T {
        let name = queue_name.unwrap_or(group);
        let queue = Self::named(&self.task_queues, name, 1);
        // The manager never closes its semaphores, so acquisition only fails
        // if the runtime is tearing down; run unqueued in that case.
        let _permit = queue.acquire_owned().await.ok();
        task.await
    }

    /// Run a fetch on the group's download queue.
    pub async fn queue_download<T>(
        &self,
        group: &str,
        concurrency: usize,
        task: impl Future<Output = T>,
    ) -> T {
        let queue = Self::named(&self.download_queues, group, concurrency);
        let _permit = queue.acquire_owned().await.ok();
        task.await
    }

    /// Submit an HTTP request through the group's task queue with bounded
    /// retry.
    ///
    /// The request waits for its queue slot, then runs under a retry wrapper:
    /// on each failure `on_failed_attempt` is invoked and may return a delay
    /// (e.g. a rate-limit retry-after) that replaces the default backoff.
    /// Non-2xx statuses are failures.
    pub async fn queue_http(
        &self,
        group: &str,
        queue_name: Option<&str>,
        request: reqwest::Request,
        retries: u32,
        on_failed_attempt: Option<FailedAttemptHook<'_, Error>>,
    ) -> Result<reqwest::Response> {
        let retry_config = RetryConfig {
            max_attempts: retries,
            ..self.retry.clone()
        };

        tracing::debug!(group, url = %request.url(), "Queueing HTTP request");

        let client = self.http.clone();
        let task = async {
            retry_with_backoff(&retry_config, on_failed_attempt, || {
                let attempt_request = request.try_clone();
                let client = client.clone();
                async move {
                    let attempt_request = attempt_request.ok_or_else(|| {
                        Error::Other("request body is not cloneable for retry".to_string())
                    })?;
                    let response = client.execute(attempt_request).await?;
                    Ok(response.error_for_status()?)
                }
            })
            .await
        };

        self.queue_task(group, queue_name, task).await
    }
}
