//! Periodic auto-refresh of URL-mode feeds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use refe_storage::Catalog;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::IngestionEngine;

/// Feed ids with a refresh currently running.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<StdMutex<HashSet<String>>>);

impl InFlight {
    fn claim(&self, feed_id: &str) -> Option<InFlightGuard> {
        let mut set = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(feed_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.clone(),
            feed_id: feed_id.to_string(),
        })
    }

    fn contains(&self, feed_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(feed_id)
    }
}

/// Releases the feed's slot when the refresh task ends, even on panic.
struct InFlightGuard {
    set: InFlight,
    feed_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.feed_id);
    }
}

/// Starts a refresh for every due feed without waiting for any of them.
///
/// A feed whose previous refresh is still running is skipped. The feed's
/// `last_auto_refresh` is stamped when its refresh ends, whether it
/// succeeded or failed, so a broken feed is retried on its normal cadence
/// rather than on every tick.
pub struct RefreshScheduler<C: Catalog> {
    engine: Arc<IngestionEngine<C>>,
    in_flight: InFlight,
}

impl<C: Catalog> RefreshScheduler<C> {
    pub fn new(engine: Arc<IngestionEngine<C>>) -> Self {
        Self {
            engine,
            in_flight: InFlight::default(),
        }
    }

    pub fn is_refreshing(&self, feed_id: &str) -> bool {
        self.in_flight.contains(feed_id)
    }

    /// One scheduler tick. Returns the handles of the refreshes it started.
    pub async fn refresh_due_feeds(&self) -> Vec<JoinHandle<()>> {
        let now = Utc::now();
        let due = self.engine.catalog().lock().await.feeds_due_for_refresh(now);
        let mut handles = Vec::new();

        for feed in due {
            let Some(guard) = self.in_flight.claim(&feed.id) else {
                debug!(feed_id = %feed.id, "refresh already running; skipping");
                continue;
            };
            let engine = self.engine.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                match engine.refresh_feed(&feed).await {
                    Ok(report) => info!(
                        feed_id = %feed.id,
                        inserted = report.inserted,
                        updated = report.updated,
                        hidden = report.hidden,
                        status = report.status.as_str(),
                        "auto-refresh finished"
                    ),
                    Err(err) => warn!(feed_id = %feed.id, error = %format!("{err:#}"), "auto-refresh failed"),
                }

                let stamped = engine
                    .catalog()
                    .lock()
                    .await
                    .stamp_auto_refresh(&feed.id, Utc::now());
                if let Err(err) = stamped {
                    warn!(feed_id = %feed.id, error = %err, "failed to stamp auto-refresh time");
                }
                if let Err(err) = engine.persist().await {
                    warn!(error = %format!("{err:#}"), "failed to persist catalog snapshot");
                }
            }));
        }

        if !handles.is_empty() {
            info!(started = handles.len(), "auto-refresh tick");
        }
        handles
    }

    /// Builds a job scheduler that runs [`Self::refresh_due_feeds`] every
    /// `tick`. The caller starts it.
    pub async fn build_job_scheduler(self: Arc<Self>, tick: Duration) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_repeated_async(tick, move |_uuid, _l| {
            let scheduler = self.clone();
            Box::pin(async move {
                scheduler.refresh_due_feeds().await;
            })
        })
        .context("creating auto-refresh job")?;
        sched.add(job).await.context("adding auto-refresh job")?;
        Ok(sched)
    }
}
