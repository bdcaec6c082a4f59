//! Per-job scheduler: one trigger engine instance per schedule job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::Result;
use crate::invoke::{build_invoker, Clients};
use crate::model::{Cadence, RunStatus, ScheduleAction, ScheduleActionRecord, ScheduleJob};
use crate::storage::{self, Pool};
use crate::trigger::{RunErrorListener, RunListener, TriggerScheduler, UnitOptions, UnitTask};

/// Outcome of the best-effort record persistence performed by after-run
/// hooks. A dropped record never blocks or retries the schedule itself.
#[derive(Debug)]
pub enum PersistOutcome {
    Persisted(ScheduleActionRecord),
    Dropped,
}

/// Owns the trigger engine for one job. The instance exists even for locked
/// or expired jobs so a later update has something to replace; it is only
/// started when the job is triggerable.
pub struct JobScheduler {
    job: ScheduleJob,
    trigger: TriggerScheduler,
}

impl JobScheduler {
    /// Build one schedulable unit per action and start them as a batch when
    /// the job's window allows it.
    pub fn build(
        job: ScheduleJob,
        clients: &Clients,
        pool: &Pool,
        correlation_id: &str,
    ) -> Result<Self> {
        let scheduler = JobScheduler {
            job,
            trigger: TriggerScheduler::new(),
        };

        let cadence = scheduler.job.definition.parse()?;
        for action in scheduler.job.actions.clone() {
            scheduler.add_action_unit(&cadence, &action, None, clients, pool, correlation_id)?;
        }

        if scheduler.job.is_triggerable(Utc::now()) {
            scheduler.trigger.start();
        } else {
            debug!(
                job = %scheduler.job.name,
                correlation_id,
                "job registered but not started (locked or expired)"
            );
        }

        Ok(scheduler)
    }

    /// Wire one action into a trigger unit: a task that runs the matching
    /// invoker, plus after-run hooks that persist a record stamped with the
    /// unit's own run timestamp. Also the construction path validation
    /// exercises, via a tag.
    pub(crate) fn add_action_unit(
        &self,
        cadence: &Cadence,
        action: &ScheduleAction,
        tag: Option<String>,
        clients: &Clients,
        pool: &Pool,
        correlation_id: &str,
    ) -> Result<Uuid> {
        let invoker = build_invoker(action, clients)?;

        let corr = correlation_id.to_string();
        let task: UnitTask = Arc::new(move || {
            let invoker = invoker.clone();
            let corr = corr.clone();
            Box::pin(async move { invoker.invoke(&corr).await })
        });

        let on_run: RunListener = {
            let pool = pool.clone();
            let job_name = self.job.name.clone();
            let action = action.clone();
            let corr = correlation_id.to_string();
            Arc::new(move |_unit, last_run| {
                let _ = record_run(
                    &pool,
                    &job_name,
                    &action,
                    RunStatus::Succeeded,
                    last_run,
                    &corr,
                );
            })
        };

        let on_error: RunErrorListener = {
            let pool = pool.clone();
            let job_name = self.job.name.clone();
            let action = action.clone();
            let corr = correlation_id.to_string();
            Arc::new(move |_unit, last_run, err| {
                error!(job = %job_name, correlation_id = %corr, "action run failed: {err:#}");
                let _ = record_run(&pool, &job_name, &action, RunStatus::Failed, last_run, &corr);
            })
        };

        Ok(self.trigger.new_unit(
            cadence.clone(),
            task,
            UnitOptions {
                start_at: self.job.definition.start_at(),
                stop_at: self.job.definition.end_at(),
                tag,
                on_run: Some(on_run),
                on_error: Some(on_error),
            },
        ))
    }

    /// Start all units. A no-op while the job is locked or its end window
    /// has elapsed; such a job is never scheduled to run.
    pub fn start(&self) {
        if !self.job.is_triggerable(Utc::now()) {
            debug!(job = %self.job.name, "job not started (locked or expired)");
            return;
        }
        self.trigger.start();
    }

    pub fn stop(&self) {
        self.trigger.stop_units();
    }

    /// Force every unit to run immediately, independent of its timing.
    /// Locked and expired jobs are never run, manual trigger included.
    pub fn trigger_now(&self) {
        if !self.job.is_triggerable(Utc::now()) {
            debug!(job = %self.job.name, "job not triggered (locked or expired)");
            return;
        }
        self.trigger.run_now_all();
    }

    pub fn shutdown(&self) {
        self.trigger.shutdown();
    }

    pub(crate) fn remove_units_by_tag(&self, tag: &str) {
        self.trigger.remove_by_tag(tag);
    }

    pub fn unit_count(&self) -> usize {
        self.trigger.unit_count()
    }
}

/// Best-effort record persistence. Failures are logged and swallowed:
/// schedule correctness takes priority over history completeness.
pub(crate) fn record_run(
    pool: &Pool,
    job_name: &str,
    action: &ScheduleAction,
    status: RunStatus,
    scheduled_at: DateTime<Utc>,
    correlation_id: &str,
) -> PersistOutcome {
    let record = ScheduleActionRecord::new(
        job_name,
        action.clone(),
        status,
        scheduled_at.timestamp_millis(),
    );

    match storage::add_record(pool, &record) {
        Ok(stored) => {
            debug!(
                job = %job_name,
                action_type = action.kind.type_name(),
                %status,
                record_id = %stored.id,
                correlation_id,
                "action record persisted"
            );
            PersistOutcome::Persisted(stored)
        }
        Err(e) => {
            error!(
                job = %job_name,
                action_type = action.kind.type_name(),
                %status,
                correlation_id,
                "failed to persist action record (run outcome lost): {e}"
            );
            PersistOutcome::Dropped
        }
    }
}
