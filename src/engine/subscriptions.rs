//! The subscription engine: polling and real-time delivery.
//!
//! Polling washers load items newer than their watermark from every
//! subscribed source on each tick. Real-time washers get one pump task per
//! source that applies the merged filter and triggers an independent
//! single-item run per delivery. The reserved log collection routes to the
//! log subscription.

use super::EngineInner;
use crate::config::LOG_COLLECTION;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::washer::Washer;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Check that every subscribed id resolves to a configured source or the
/// reserved log collection. Called at wiring time, when the full source set
/// is known.
pub(crate) fn validate_sources(washer: &Washer, sources: &HashSet<String>) -> Result<()> {
    for id in washer.subscribe() {
        if id.as_str() != LOG_COLLECTION && !sources.contains(id) {
            return Err(Error::config(
                "subscribe",
                format!("can't subscribe to '{id}', no such source"),
            ));
        }
    }
    Ok(())
}

/// Load items newer than `since` from every subscribed source, merged with
/// the washer's filter. Results are concatenated across sources; there is
/// no cross-source ordering guarantee.
pub(crate) async fn load_subscriptions(
    engine: &EngineInner,
    washer: &Washer,
    since: DateTime<Utc>,
) -> Result<Vec<Item>> {
    let filter = washer.merged_filter();
    let mut input = Vec::new();

    for id in washer.subscribe() {
        if id.as_str() == LOG_COLLECTION {
            // The log collection only delivers in real-time mode
            continue;
        }
        let items = engine.store.load_items(id, since, filter.as_ref()).await?;
        input.extend(items);
    }

    Ok(input)
}

/// Spawn one pump task per subscribed source for a real-time washer.
pub(crate) fn spawn_realtime(
    inner: Arc<EngineInner>,
    washer: Arc<Washer>,
) -> Vec<JoinHandle<()>> {
    let filter = washer.merged_filter();

    washer
        .subscribe()
        .iter()
        .map(|source_id| {
            let mut rx = if source_id.as_str() == LOG_COLLECTION {
                inner.store.subscribe_to_log()
            } else {
                inner.store.subscribe_to_washer(source_id)
            };

            let inner = inner.clone();
            let washer = washer.clone();
            let filter = filter.clone();
            let source_id = source_id.clone();

            tokio::spawn(async move {
                tracing::debug!(washer = %washer.id(), source = %source_id, "Real-time subscription started");

                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(item) => {
                                if filter.as_ref().is_none_or(|f| f.matches(&item)) {
                                    inner.push(&washer, item).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(
                                    washer = %washer.id(),
                                    source = %source_id,
                                    skipped,
                                    "Subscription lagged, items skipped"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }

                tracing::debug!(washer = %washer.id(), source = %source_id, "Real-time subscription stopped");
            })
        })
        .collect()
}
