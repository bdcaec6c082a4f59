//! Application services -- the operations behind the HTTP API and the CLI.
//!
//! Every mutation goes through the scheduler manager first, then the store.
//! Registration proves the job constructible; a job that cannot be scheduled
//! is never persisted.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{Result, SchedulerError};
use crate::manager::SchedulerManager;
use crate::model::{
    assign_action_ids, AdminState, RunStatus, ScheduleAction, ScheduleActionRecord, ScheduleDef,
    ScheduleJob,
};
use crate::storage::{self, Pool, RecordFilter};

/// Partial job update. Absent fields keep their stored values; a present
/// `actions` list replaces all actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub definition: Option<ScheduleDef>,
    pub actions: Option<Vec<ScheduleAction>>,
    pub admin_state: Option<AdminState>,
    pub auto_trigger_missed_records: Option<bool>,
    pub labels: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct Service {
    manager: Arc<SchedulerManager>,
    pool: Pool,
}

impl Service {
    pub fn new(manager: Arc<SchedulerManager>, pool: Pool) -> Self {
        Service { manager, pool }
    }

    pub fn manager(&self) -> &SchedulerManager {
        &self.manager
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Create a job: assign identity, register it with the manager, then
    /// persist. A job the manager rejects is never written; a persistence
    /// failure rolls the registration back.
    pub async fn add_job(&self, mut job: ScheduleJob, correlation_id: &str) -> Result<ScheduleJob> {
        job.check_identity()?;

        if job.id.is_empty() {
            job.id = uuid::Uuid::new_v4().to_string();
        }
        assign_action_ids(&mut job.actions);
        let now = crate::model::now_millis();
        job.created = now;
        job.modified = now;

        self.manager.add_job(&job, correlation_id).await?;

        match storage::add_job(&self.pool, &job) {
            Ok(stored) => {
                info!(job = %stored.name, job_id = %stored.id, correlation_id, "schedule job created");
                Ok(stored)
            }
            Err(e) => {
                if let Err(teardown) = self
                    .manager
                    .delete_job_by_name(&job.name, correlation_id)
                    .await
                {
                    warn!(job = %job.name, correlation_id, "rollback after failed persist: {teardown}");
                }
                Err(e)
            }
        }
    }

    /// Merge a patch into the stored job, re-register, then persist. The
    /// patch addresses the job by id or name; naming a different job than
    /// the id resolves to is a contract violation.
    pub async fn patch_job(&self, patch: JobPatch, correlation_id: &str) -> Result<ScheduleJob> {
        let mut job = self.fetch_patched_target(&patch)?;

        if let Some(definition) = patch.definition {
            job.definition = definition;
        }
        if let Some(mut actions) = patch.actions {
            // A patch replaces the whole action list; every action gets a
            // fresh id and prior per-action history goes stale.
            assign_action_ids(&mut actions);
            job.actions = actions;
        }
        if let Some(state) = patch.admin_state {
            job.admin_state = state;
        }
        if let Some(auto) = patch.auto_trigger_missed_records {
            job.auto_trigger_missed_records = auto;
        }
        if let Some(labels) = patch.labels {
            job.labels = labels;
        }
        job.check_identity()?;

        self.manager.update_job(&job, correlation_id).await?;
        let stored = storage::update_job(&self.pool, &job)?;

        info!(job = %stored.name, job_id = %stored.id, correlation_id, "schedule job updated");
        Ok(stored)
    }

    fn fetch_patched_target(&self, patch: &JobPatch) -> Result<ScheduleJob> {
        match (&patch.id, &patch.name) {
            (Some(id), name) => {
                let job = storage::job_by_id(&self.pool, id)?;
                if let Some(name) = name {
                    if !name.is_empty() && *name != job.name {
                        return Err(SchedulerError::ContractInvalid(format!(
                            "job id '{id}' belongs to '{}', not '{name}'",
                            job.name
                        )));
                    }
                }
                Ok(job)
            }
            (None, Some(name)) if !name.is_empty() => storage::job_by_name(&self.pool, name),
            _ => Err(SchedulerError::ContractInvalid(
                "patch names neither a job id nor a job name".to_string(),
            )),
        }
    }

    /// Stop and unregister the job, then remove its row. Records are kept;
    /// history outlives the job.
    pub async fn delete_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        self.manager.delete_job_by_name(name, correlation_id).await?;
        storage::delete_job_by_name(&self.pool, name)?;
        info!(job = %name, correlation_id, "schedule job deleted");
        Ok(())
    }

    pub async fn trigger_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        self.manager.trigger_job_by_name(name, correlation_id).await
    }

    pub fn job_by_name(&self, name: &str) -> Result<ScheduleJob> {
        storage::job_by_name(&self.pool, name)
    }

    /// Paged job listing, optionally filtered to jobs carrying every label.
    pub fn all_jobs(
        &self,
        labels: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleJob>, u64)> {
        let total = storage::job_total_count(&self.pool, labels)?;
        let jobs = storage::all_jobs(&self.pool, labels, offset, limit)?;
        Ok((jobs, total))
    }

    /// Paged record listing within `[start, end]` on the persistence stamp.
    pub fn all_records(
        &self,
        start: i64,
        end: i64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleActionRecord>, u64)> {
        self.query_records(RecordFilter::All, start, end, offset, limit)
    }

    pub fn records_by_status(
        &self,
        status: RunStatus,
        start: i64,
        end: i64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleActionRecord>, u64)> {
        self.query_records(RecordFilter::Status(status), start, end, offset, limit)
    }

    pub fn records_by_job_name(
        &self,
        job_name: &str,
        start: i64,
        end: i64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleActionRecord>, u64)> {
        self.query_records(RecordFilter::Job(job_name), start, end, offset, limit)
    }

    pub fn records_by_job_and_status(
        &self,
        job_name: &str,
        status: RunStatus,
        start: i64,
        end: i64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleActionRecord>, u64)> {
        self.query_records(
            RecordFilter::JobAndStatus(job_name, status),
            start,
            end,
            offset,
            limit,
        )
    }

    fn query_records(
        &self,
        filter: RecordFilter<'_>,
        start: i64,
        end: i64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<ScheduleActionRecord>, u64)> {
        let total = storage::record_count_in_range(&self.pool, filter, start, end)?;
        let records = storage::records(&self.pool, filter, start, end, offset, limit)?;
        Ok((records, total))
    }

    /// The most recent record per (job, action) across all jobs, paged.
    pub fn latest_records(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScheduleActionRecord>> {
        storage::latest_records(&self.pool, offset, limit)
    }

    /// The most recent record per action of one job.
    pub fn latest_records_by_job_name(&self, job_name: &str) -> Result<Vec<ScheduleActionRecord>> {
        // Resolving the name first turns "no such job" into a not-found
        // rather than an empty list.
        storage::job_by_name(&self.pool, job_name)?;
        storage::latest_records_by_job(&self.pool, job_name)
    }

    pub fn delete_records_by_age(&self, age_ms: i64, correlation_id: &str) -> Result<usize> {
        let deleted = storage::delete_records_by_age(&self.pool, age_ms)?;
        info!(deleted, age_ms, correlation_id, "action records deleted by age");
        Ok(deleted)
    }
}
