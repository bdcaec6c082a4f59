//! Action record retention.
//!
//! A background task that keeps the record table bounded: once the total
//! count reaches the maximum cap, everything older than the newest
//! `min_cap` records is deleted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::model::now_millis;
use crate::storage::{self, Pool, RecordFilter};

pub struct RetentionPurger {
    pool: Pool,
    interval: Duration,
    max_cap: usize,
    min_cap: usize,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl RetentionPurger {
    pub fn new(pool: Pool, interval: Duration, max_cap: usize, min_cap: usize) -> Self {
        RetentionPurger {
            pool,
            interval,
            max_cap,
            min_cap,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the purge loop. A second call on the same instance is a no-op
    /// and returns `None`; there is never more than one loop per purger.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("retention purger already started, ignoring");
            return None;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            max_cap = self.max_cap,
            min_cap = self.min_cap,
            "retention purger started"
        );

        let purger = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(purger.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately once; skip that tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = purger.cancel.cancelled() => {
                        info!("retention purger stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        // Purge errors are retried at the next tick.
                        match purge_records(&purger.pool, purger.max_cap, purger.min_cap) {
                            Ok(0) => {}
                            Ok(deleted) => {
                                info!(deleted, "purged aged action records");
                            }
                            Err(e) => error!("action record purge failed: {e}"),
                        }
                    }
                }
            }
        }))
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One purge pass. Below the maximum cap nothing is deleted; at or above
/// it, the record at offset `min_cap` from the newest end becomes the age
/// boundary and everything older goes.
pub fn purge_records(pool: &Pool, max_cap: usize, min_cap: usize) -> Result<usize> {
    let total = storage::record_count_in_range(pool, RecordFilter::All, 0, now_millis())?;
    if (total as usize) < max_cap {
        debug!(total, max_cap, "record count below cap, nothing to purge");
        return Ok(0);
    }

    let Some(boundary) = storage::latest_record_by_offset(pool, min_cap)? else {
        return Ok(0);
    };

    let age = now_millis() - boundary.created;
    storage::delete_records_by_age(pool, age.max(0))
}
