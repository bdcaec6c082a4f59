//! Missed-run backfill.
//!
//! At service start every stored job is reconciled against wall-clock time:
//! trigger instants that should have fired while the service was down become
//! Missed records, and jobs that opt in are triggered once afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, SchedulerError};
use crate::manager::SchedulerManager;
use crate::model::{
    from_millis, AdminState, Cadence, RunStatus, ScheduleActionRecord, ScheduleJob,
};
use crate::storage::{self, Pool};

/// Upper bound on jobs considered during one reconciliation pass.
const RECONCILE_LIMIT: usize = 999;

/// Every interval instant after `last_run`, strictly before `now`, in
/// increasing order. Empty when `now - last_run < interval`.
pub fn find_missed_interval_runs(
    last_run: DateTime<Utc>,
    now: DateTime<Utc>,
    interval: std::time::Duration,
) -> Vec<DateTime<Utc>> {
    let Ok(step) = chrono::Duration::from_std(interval) else {
        return Vec::new();
    };
    if step.is_zero() {
        return Vec::new();
    }

    let mut runs = Vec::new();
    let mut t = last_run + step;
    while t < now {
        runs.push(t);
        t += step;
    }
    runs
}

/// Every cron instant reached by repeated "next after" applications seeded
/// at `last_run`, strictly before `now`, in increasing order.
pub fn find_missed_cron_runs(
    last_run: DateTime<Utc>,
    now: DateTime<Utc>,
    cadence: &Cadence,
) -> Vec<DateTime<Utc>> {
    let mut runs = Vec::new();
    let mut t = last_run;
    while let Some(next) = cadence.next_after(t) {
        if next >= now {
            break;
        }
        runs.push(next);
        t = next;
    }
    runs
}

/// Missed instants for one definition between `last_run` and `now`.
fn generate_missed_runs(
    job: &ScheduleJob,
    last_run: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>> {
    let cadence = job.definition.parse()?;
    Ok(match &cadence {
        Cadence::Interval(d) => find_missed_interval_runs(last_run, now, *d),
        Cadence::Cron { .. } => find_missed_cron_runs(last_run, now, &cadence),
    })
}

/// Backfill Missed records for one job, given the latest persisted record
/// per action. Returns the number of records written.
///
/// The low-water mark per action is the latest record's scheduled instant,
/// raised to the job's modified time when older (a definition edit
/// invalidates pre-edit history); actions with no record start from the
/// modified time. An expired job's history is frozen: no backfill at all.
pub fn generate_missed_records(
    pool: &Pool,
    job: &ScheduleJob,
    latest_records: &[ScheduleActionRecord],
    correlation_id: &str,
) -> Result<usize> {
    let now = Utc::now();
    if job.is_expired(now) {
        debug!(job = %job.name, correlation_id, "job window expired, history frozen");
        return Ok(0);
    }

    let modified = from_millis(job.modified).ok_or_else(|| {
        SchedulerError::ContractInvalid(format!(
            "job '{}' has an invalid modified timestamp",
            job.name
        ))
    })?;

    let mut missed = Vec::new();
    for action in &job.actions {
        let last_recorded = latest_records
            .iter()
            .find(|r| r.action.id == action.id)
            .and_then(|r| from_millis(r.scheduled_at));

        let mut low_water = last_recorded.unwrap_or(modified);
        if low_water < modified {
            low_water = modified;
        }

        for run in generate_missed_runs(job, low_water, now)? {
            missed.push(ScheduleActionRecord::new(
                &job.name,
                action.clone(),
                RunStatus::Missed,
                run.timestamp_millis(),
            ));
        }
    }

    if missed.is_empty() {
        return Ok(0);
    }

    let written = storage::add_records(pool, &missed)?;
    info!(
        job = %job.name,
        count = written,
        correlation_id,
        "missed action records backfilled"
    );
    Ok(written)
}

/// Startup reconciliation: load every stored job into the manager, then
/// backfill missed runs for the unlocked ones. Guarded so a second call in
/// the same process is a no-op.
pub struct Reconciler {
    fired: AtomicBool,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            fired: AtomicBool::new(false),
        }
    }

    /// One job's failure aborts that job's backfill only; every other job
    /// is still reconciled and the service still starts.
    pub async fn run(
        &self,
        pool: &Pool,
        manager: &SchedulerManager,
        correlation_id: &str,
    ) -> Result<()> {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(correlation_id, "reconciliation already ran, skipping");
            return Ok(());
        }

        let jobs = storage::all_jobs(pool, &[], 0, RECONCILE_LIMIT)
            .map_err(|e| SchedulerError::Database(format!("failed to load stored jobs: {e}")))?;

        for job in jobs {
            if let Err(e) = self.reconcile_job(pool, manager, &job, correlation_id).await {
                error!(job = %job.name, correlation_id, "failed to reconcile job: {e}");
            }
        }

        Ok(())
    }

    async fn reconcile_job(
        &self,
        pool: &Pool,
        manager: &SchedulerManager,
        job: &ScheduleJob,
        correlation_id: &str,
    ) -> Result<()> {
        manager.add_job(job, correlation_id).await?;

        if job.admin_state == AdminState::Locked {
            debug!(job = %job.name, correlation_id, "job loaded but not started (locked)");
            return Ok(());
        }

        manager.start_job_by_name(&job.name, correlation_id).await?;

        let latest = storage::latest_records_by_job(pool, &job.name)?;
        let backfilled = generate_missed_records(pool, job, &latest, correlation_id)?;

        if backfilled > 0 && job.auto_trigger_missed_records {
            if let Err(e) = manager.trigger_job_by_name(&job.name, correlation_id).await {
                warn!(job = %job.name, correlation_id, "auto-trigger after backfill failed: {e}");
            }
        }

        debug!(job = %job.name, correlation_id, "job reconciled and started");
        Ok(())
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, DefKind, ScheduleAction, ScheduleDef};
    use crate::storage::RecordFilter;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_missed_interval_runs_examples() {
        let last = utc(0, 0);
        let hour = std::time::Duration::from_secs(3600);

        // now = last + 70m -> exactly one missed run at last + 1h
        let runs = find_missed_interval_runs(last, utc(1, 10), hour);
        assert_eq!(runs, vec![utc(1, 0)]);

        // now = last + 130m -> two missed runs
        let runs = find_missed_interval_runs(last, utc(2, 10), hour);
        assert_eq!(runs, vec![utc(1, 0), utc(2, 0)]);

        // now - last < interval -> empty
        assert!(find_missed_interval_runs(last, utc(0, 30), hour).is_empty());
    }

    #[test]
    fn test_missed_interval_runs_are_increasing() {
        let last = utc(0, 0);
        let runs =
            find_missed_interval_runs(last, utc(6, 1), std::time::Duration::from_secs(3600));
        assert_eq!(runs.len(), 6);
        assert!(runs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_missed_cron_runs_match_interval_examples() {
        let cadence = ScheduleDef {
            start_timestamp: None,
            end_timestamp: None,
            kind: DefKind::Cron {
                crontab: "CRON_TZ=UTC 0 * * * *".to_string(),
                timezone: None,
            },
        }
        .parse()
        .unwrap();

        let last = utc(0, 0);
        assert_eq!(find_missed_cron_runs(last, utc(1, 10), &cadence), vec![utc(1, 0)]);
        assert_eq!(
            find_missed_cron_runs(last, utc(2, 10), &cadence),
            vec![utc(1, 0), utc(2, 0)]
        );
        assert!(find_missed_cron_runs(last, utc(0, 30), &cadence).is_empty());
    }

    fn backfill_job(name: &str, modified: DateTime<Utc>) -> ScheduleJob {
        ScheduleJob {
            id: "id".to_string(),
            name: name.to_string(),
            definition: ScheduleDef {
                start_timestamp: None,
                end_timestamp: None,
                kind: DefKind::Interval {
                    interval: "1h".to_string(),
                },
            },
            actions: vec![ScheduleAction {
                id: "a-1".to_string(),
                content_type: "application/json".to_string(),
                payload: vec![],
                kind: ActionKind::MessageBus {
                    topic: "edge/t".to_string(),
                },
            }],
            admin_state: AdminState::Unlocked,
            auto_trigger_missed_records: false,
            labels: vec![],
            created: modified.timestamp_millis(),
            modified: modified.timestamp_millis(),
        }
    }

    fn test_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_backfill_writes_missed_records() {
        let (_dir, pool) = test_pool();
        let modified = Utc::now() - chrono::Duration::minutes(130);
        let job = backfill_job("backfill", modified);

        // No prior records: the low-water mark is the modified time.
        let written = generate_missed_records(&pool, &job, &[], "corr").unwrap();
        assert_eq!(written, 2);

        let records = storage::records(
            &pool,
            RecordFilter::JobAndStatus("backfill", RunStatus::Missed),
            0,
            0,
            0,
            10,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.action.id == "a-1"));
    }

    #[test]
    fn test_modified_wins_over_older_record() {
        let (_dir, pool) = test_pool();
        let modified = Utc::now() - chrono::Duration::minutes(70);
        let job = backfill_job("edited", modified);

        // A record from long before the definition edit must not widen the
        // backfill window.
        let stale = ScheduleActionRecord::new(
            "edited",
            job.actions[0].clone(),
            RunStatus::Succeeded,
            (Utc::now() - chrono::Duration::days(3)).timestamp_millis(),
        );

        let written = generate_missed_records(&pool, &job, &[stale], "corr").unwrap();
        assert_eq!(written, 1);
    }

    #[test]
    fn test_expired_job_is_frozen() {
        let (_dir, pool) = test_pool();
        let modified = Utc::now() - chrono::Duration::minutes(130);
        let mut job = backfill_job("expired", modified);
        job.definition.end_timestamp =
            Some((Utc::now() - chrono::Duration::minutes(5)).timestamp_millis());

        let written = generate_missed_records(&pool, &job, &[], "corr").unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_reconciler_runs_only_once() {
        let (_dir, pool) = test_pool();
        let (clients, _, _) = crate::invoke::test_support::test_clients();
        let manager = SchedulerManager::new(clients, pool.clone());

        storage::add_job(&pool, &backfill_job("once", Utc::now())).unwrap();

        let reconciler = Reconciler::new();
        reconciler.run(&pool, &manager, "corr").await.unwrap();
        assert!(manager.contains("once").await);

        // Second call is a no-op: the already-registered job would otherwise
        // produce a conflict.
        reconciler.run(&pool, &manager, "corr").await.unwrap();
    }
}
