//! Per-job trigger engine.
//!
//! One `TriggerScheduler` owns the schedulable units of a single job. Units
//! are created idle; `start` spawns one independently-timed tokio task per
//! unit, `stop_units` cancels them cooperatively (in-flight runs finish),
//! and `run_now` fires a unit immediately without touching its cadence.
//! After every run the unit's listeners receive the unit id and the run's
//! own timestamp.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::Cadence;

/// The work a unit performs on each fire. Returns a short textual result
/// for logging; failure is reported to the error listener, never propagated.
pub type UnitTask = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

pub type RunListener = Arc<dyn Fn(Uuid, DateTime<Utc>) + Send + Sync>;
pub type RunErrorListener = Arc<dyn Fn(Uuid, DateTime<Utc>, &anyhow::Error) + Send + Sync>;

/// Construction options for one unit.
#[derive(Default)]
pub struct UnitOptions {
    /// Deferred start. In the past (or absent) means the first run is
    /// immediate for interval cadences.
    pub start_at: Option<DateTime<Utc>>,
    /// No fires at or after this instant.
    pub stop_at: Option<DateTime<Utc>>,
    /// Grouping tag, used to remove throwaway validation units.
    pub tag: Option<String>,
    pub on_run: Option<RunListener>,
    pub on_error: Option<RunErrorListener>,
}

struct Unit {
    id: Uuid,
    tag: Option<String>,
    cadence: Cadence,
    start_at: Option<DateTime<Utc>>,
    stop_at: Option<DateTime<Utc>>,
    task: UnitTask,
    on_run: Option<RunListener>,
    on_error: Option<RunErrorListener>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

/// Snapshot of a unit for listing.
#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub id: Uuid,
    pub tag: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct TriggerScheduler {
    units: Mutex<Vec<Arc<Unit>>>,
}

impl TriggerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new idle unit and return its id.
    pub fn new_unit(&self, cadence: Cadence, task: UnitTask, opts: UnitOptions) -> Uuid {
        let unit = Arc::new(Unit {
            id: Uuid::new_v4(),
            tag: opts.tag,
            cadence,
            start_at: opts.start_at,
            stop_at: opts.stop_at,
            task,
            on_run: opts.on_run,
            on_error: opts.on_error,
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        });
        let id = unit.id;
        self.units.lock().expect("units lock").push(unit);
        id
    }

    /// Start every idle unit as a batch. Already-running units are left
    /// alone, so start after stop resumes the remainder.
    pub fn start(&self) {
        let units = self.units.lock().expect("units lock").clone();
        for unit in units {
            if unit.running.swap(true, Ordering::SeqCst) {
                continue;
            }
            let token = CancellationToken::new();
            *unit.cancel.lock().expect("cancel lock") = token.clone();
            tokio::spawn(run_loop(unit, token));
        }
    }

    /// Cooperatively stop all timed loops; units stay registered.
    pub fn stop_units(&self) {
        let units = self.units.lock().expect("units lock");
        for unit in units.iter() {
            unit.cancel.lock().expect("cancel lock").cancel();
            unit.running.store(false, Ordering::SeqCst);
        }
    }

    /// Stop everything and drop all units.
    pub fn shutdown(&self) {
        self.stop_units();
        self.units.lock().expect("units lock").clear();
    }

    /// Fire every unit immediately, independent of its normal timing.
    pub fn run_now_all(&self) {
        let units = self.units.lock().expect("units lock").clone();
        for unit in units {
            tokio::spawn(async move { fire(&unit).await });
        }
    }

    /// List registered units.
    pub fn units(&self) -> Vec<UnitInfo> {
        self.units
            .lock()
            .expect("units lock")
            .iter()
            .map(|u| UnitInfo {
                id: u.id,
                tag: u.tag.clone(),
                last_run: *u.last_run.lock().expect("last_run lock"),
            })
            .collect()
    }

    /// Remove every unit carrying `tag`, cancelling any that run.
    pub fn remove_by_tag(&self, tag: &str) {
        let mut units = self.units.lock().expect("units lock");
        units.retain(|unit| {
            if unit.tag.as_deref() == Some(tag) {
                unit.cancel.lock().expect("cancel lock").cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().expect("units lock").len()
    }
}

/// Timed loop for one unit: wait out the deferred start, then fire on
/// cadence until the stop instant or cancellation.
async fn run_loop(unit: Arc<Unit>, token: CancellationToken) {
    let now = Utc::now();

    if let Some(start) = unit.start_at {
        if start > now && !sleep_until(start, &token).await {
            unit.running.store(false, Ordering::SeqCst);
            return;
        }
    }

    // Interval cadences run immediately at the effective start; cron
    // cadences wait for their next expression instant.
    let mut next = match &unit.cadence {
        Cadence::Interval(_) => Utc::now(),
        cadence => match cadence.next_after(Utc::now()) {
            Some(t) => t,
            None => {
                unit.running.store(false, Ordering::SeqCst);
                return;
            }
        },
    };

    loop {
        if let Some(stop) = unit.stop_at {
            if next >= stop {
                break;
            }
        }
        if !sleep_until(next, &token).await {
            break;
        }

        fire(&unit).await;

        next = match unit.cadence.next_after(Utc::now()) {
            Some(t) => t,
            None => break,
        };
    }

    unit.running.store(false, Ordering::SeqCst);
}

/// Sleep until `deadline` unless cancelled. Returns false on cancellation.
async fn sleep_until(deadline: DateTime<Utc>, token: &CancellationToken) -> bool {
    let wait = (deadline - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = token.cancelled() => false,
    }
}

/// Run the unit's task once and notify the matching listener with the run's
/// own timestamp.
async fn fire(unit: &Unit) {
    let fired_at = Utc::now();
    *unit.last_run.lock().expect("last_run lock") = Some(fired_at);

    match (unit.task)().await {
        Ok(_) => {
            if let Some(listener) = &unit.on_run {
                listener(unit.id, fired_at);
            }
        }
        Err(e) => {
            if let Some(listener) = &unit.on_error {
                listener(unit.id, fired_at, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DefKind, ScheduleDef};
    use std::sync::atomic::AtomicUsize;

    fn interval_cadence(s: &str) -> Cadence {
        ScheduleDef {
            start_timestamp: None,
            end_timestamp: None,
            kind: DefKind::Interval {
                interval: s.to_string(),
            },
        }
        .parse()
        .unwrap()
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> UnitTask {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            })
        })
    }

    #[tokio::test]
    async fn test_idle_units_never_fire() {
        let scheduler = TriggerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.new_unit(
            interval_cadence("10ms"),
            counting_task(counter.clone()),
            UnitOptions::default(),
        );

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interval_unit_fires_repeatedly() {
        let scheduler = TriggerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.new_unit(
            interval_cadence("10ms"),
            counting_task(counter.clone()),
            UnitOptions::default(),
        );
        scheduler.start();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 2);

        scheduler.stop_units();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // At most one in-flight run may still finish after the stop.
        assert!(counter.load(Ordering::SeqCst) <= after_stop + 1);
    }

    #[tokio::test]
    async fn test_run_now_fires_once_and_records_last_run() {
        let scheduler = TriggerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.new_unit(
            interval_cadence("1h"),
            counting_task(counter.clone()),
            UnitOptions::default(),
        );

        scheduler.run_now_all();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.units()[0].last_run.is_some());
    }

    #[tokio::test]
    async fn test_error_listener_receives_failures() {
        let scheduler = TriggerScheduler::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_in_listener = errors.clone();
        let task: UnitTask =
            Arc::new(|| Box::pin(async { Err(anyhow::anyhow!("transport down")) }));

        scheduler.new_unit(
            interval_cadence("1h"),
            task,
            UnitOptions {
                on_error: Some(Arc::new(move |_, _, _| {
                    errors_in_listener.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        scheduler.run_now_all();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while errors.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_by_tag_leaves_untagged_units() {
        let scheduler = TriggerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.new_unit(
            interval_cadence("1h"),
            counting_task(counter.clone()),
            UnitOptions::default(),
        );
        for _ in 0..2 {
            scheduler.new_unit(
                interval_cadence("1h"),
                counting_task(counter.clone()),
                UnitOptions {
                    tag: Some("validation-x".to_string()),
                    ..Default::default()
                },
            );
        }
        assert_eq!(scheduler.unit_count(), 3);

        scheduler.remove_by_tag("validation-x");
        assert_eq!(scheduler.unit_count(), 1);
        assert!(scheduler.units()[0].tag.is_none());
    }

    #[tokio::test]
    async fn test_stop_at_in_past_prevents_fires() {
        let scheduler = TriggerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.new_unit(
            interval_cadence("10ms"),
            counting_task(counter.clone()),
            UnitOptions {
                stop_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                ..Default::default()
            },
        );
        scheduler.start();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
