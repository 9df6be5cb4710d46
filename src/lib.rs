//! # laundromat
//!
//! Library-first orchestration engine for scheduled content-ingestion
//! pipelines built from independent processing units called washers.
//!
//! ## Design Philosophy
//!
//! laundromat is designed to be:
//! - **Composable** - washers are plain trait implementations over a shared engine
//! - **Bounded** - outbound requests and downloads respect per-group concurrency limits
//! - **Durable** - items, watermarks, and logs persist through a pluggable state store
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//!
//! ## Washer kinds
//!
//! - **Wash** retrieves data on a schedule and normalizes it into [`Item`]s
//! - **Rinse** subscribes to other washers and emits transformed items
//! - **Dry** subscribes to other washers and acts on items without emitting
//! - **Fix** runs scheduled maintenance with no item flow
//!
//! ## Quick Start
//!
//! ```no_run
//! use laundromat::{
//!     EngineConfig, Item, Laundromat, WashConfig, WashJob, Washer, WasherContext,
//! };
//! use laundromat::store::memory::MemoryStore;
//! use std::sync::Arc;
//!
//! struct HelloWash;
//!
//! #[async_trait::async_trait]
//! impl WashJob for HelloWash {
//!     async fn run(&self, ctx: &mut WasherContext<'_>) -> laundromat::Result<Vec<Item>> {
//!         Ok(vec![ctx.item("https://example.com/hello", chrono::Utc::now())?])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Laundromat::new(EngineConfig::default(), Arc::new(MemoryStore::new())).await?;
//!
//!     let config: WashConfig = serde_json::from_value(serde_json::json!({
//!         "id": "hello",
//!         "schedule": "0 * * * * *",
//!     }))?;
//!     engine.add_washer(Washer::wash("example/hello", config, Arc::new(HelloWash))?)?;
//!
//!     engine.start().await?;
//!     laundromat::run_with_shutdown(engine).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Attachment descriptors and results
pub mod download;
/// The orchestration engine
pub mod engine;
/// Error types
pub mod error;
/// Media fetching and the content store
pub mod fetch;
/// Structured item filters
pub mod filter;
/// The normalized content record
pub mod item;
/// Log-as-record subsystem
pub mod log;
/// Bounded concurrency for outbound work
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// State-store contract and drivers
pub mod store;
/// Washers and job traits
pub mod washer;

// Re-export commonly used types
pub use config::{
    DryConfig, EngineConfig, FixConfig, LOG_COLLECTION, RetryConfig, RinseConfig, WashConfig,
};
pub use download::{Download, DownloadResult};
pub use engine::Laundromat;
pub use error::{DownloadError, Error, Result, StoreError};
pub use fetch::content::{ContentStore, FsContentStore};
pub use fetch::{Downloader, MediaFetcher};
pub use filter::Filter;
pub use item::{Author, Enclosure, Item, ItemSource, Location};
pub use log::{Journal, LogLevel, LogMessage};
pub use queue::QueueManager;
pub use store::{Memory, StateStore};
pub use washer::{
    DryJob, FixJob, RinseJob, WashJob, Washer, WasherContext, WasherKind,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: Laundromat) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
