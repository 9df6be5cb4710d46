//! Per-washer schedule loops.
//!
//! Each schedule-driven washer gets one task that sleeps until the next
//! cron occurrence and fires a tick. Ticks that land while the washer is
//! still running (or paused) are dropped; there is no queue of missed
//! ticks, so a slow run simply absorbs the ticks it overlaps.

use super::EngineInner;
use crate::washer::Washer;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub(crate) fn spawn_schedule(inner: Arc<EngineInner>, washer: Arc<Washer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(expr) = washer.schedule() else {
            return;
        };
        // Validated at construction; a parse failure here means the washer
        // was built outside the constructors
        let schedule = match Schedule::from_str(expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(washer = %washer.id(), error = %e, "Invalid schedule expression");
                return;
            }
        };

        tracing::debug!(washer = %washer.id(), schedule = expr, "Schedule started");

        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                tracing::warn!(washer = %washer.id(), "Schedule has no future occurrences");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    inner.tick(&washer).await;
                }
            }
        }

        tracing::debug!(washer = %washer.id(), "Schedule stopped");
    })
}
