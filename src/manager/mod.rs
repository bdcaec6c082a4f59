//! Scheduler manager -- the registry of all per-job schedulers.
//!
//! Registry mutations (add/update/delete/shutdown) take the exclusive lock;
//! lookups take the shared lock. Validation constructs and tears down its
//! throwaway units against the already-fetched scheduler without re-locking
//! the registry.

pub mod job;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{Result, SchedulerError};
use crate::invoke::Clients;
use crate::model::ScheduleJob;
use crate::storage::Pool;

pub use job::{JobScheduler, PersistOutcome};

pub struct SchedulerManager {
    registry: RwLock<HashMap<String, Arc<JobScheduler>>>,
    clients: Clients,
    pool: Pool,
}

impl SchedulerManager {
    pub fn new(clients: Clients, pool: Pool) -> Self {
        SchedulerManager {
            registry: RwLock::new(HashMap::new()),
            clients,
            pool,
        }
    }

    /// Register and (window permitting) start a new job. Fails with a
    /// conflict if a scheduler already exists for the name.
    pub async fn add_job(&self, job: &ScheduleJob, correlation_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        if registry.contains_key(&job.name) {
            return Err(SchedulerError::Conflict(format!(
                "schedule job '{}' already exists",
                job.name
            )));
        }

        let scheduler = JobScheduler::build(job.clone(), &self.clients, &self.pool, correlation_id)?;
        registry.insert(job.name.clone(), Arc::new(scheduler));

        info!(job = %job.name, job_id = %job.id, correlation_id, "job added to the scheduler manager");
        Ok(())
    }

    /// Replace a job's schedule: validate first, then delete-then-add under
    /// one exclusive lock. The old schedule is only torn down after the new
    /// one is proven constructible; a crash between the two steps leaves the
    /// job unscheduled until the next reconciliation, never double-scheduled.
    pub async fn update_job(&self, job: &ScheduleJob, correlation_id: &str) -> Result<()> {
        self.validate_job(job, correlation_id).await?;

        let mut registry = self.registry.write().await;
        let old = registry.remove(&job.name).ok_or_else(|| {
            SchedulerError::NotFound(format!("schedule job '{}' does not exist", job.name))
        })?;
        old.shutdown();
        debug!(job = %job.name, correlation_id, "old schedule torn down for update");

        let scheduler = JobScheduler::build(job.clone(), &self.clients, &self.pool, correlation_id)?;
        registry.insert(job.name.clone(), Arc::new(scheduler));

        debug!(job = %job.name, job_id = %job.id, correlation_id, "job updated in the scheduler manager");
        Ok(())
    }

    /// Shut down every unit of a job and remove its registration.
    pub async fn delete_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let scheduler = registry.remove(name).ok_or_else(|| {
            SchedulerError::NotFound(format!("schedule job '{name}' does not exist"))
        })?;
        scheduler.shutdown();

        debug!(job = %name, correlation_id, "job stopped and removed from the scheduler manager");
        Ok(())
    }

    /// Start all units of an existing job without changing registration.
    pub async fn start_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        let scheduler = self.get(name).await?;
        scheduler.start();
        debug!(job = %name, correlation_id, "job started");
        Ok(())
    }

    /// Stop all units of an existing job without removing registration.
    pub async fn stop_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        let scheduler = self.get(name).await?;
        scheduler.stop();
        debug!(job = %name, correlation_id, "job stopped");
        Ok(())
    }

    /// Force every unit of a job to run immediately.
    pub async fn trigger_job_by_name(&self, name: &str, correlation_id: &str) -> Result<()> {
        let scheduler = self.get(name).await?;
        scheduler.trigger_now();
        debug!(job = %name, correlation_id, "job triggered manually");
        Ok(())
    }

    /// Prove the job's definition and every action are constructible by
    /// creating throwaway tagged units on the job's existing scheduler and
    /// removing them immediately. The units are never started, so live
    /// schedules are unaffected.
    pub async fn validate_job(&self, job: &ScheduleJob, correlation_id: &str) -> Result<()> {
        job.check_identity()?;

        let scheduler = self.get(&job.name).await?;
        let tag = format!("validate-{}", Uuid::new_v4());

        let outcome: Result<()> = (|| {
            let cadence = job.definition.parse()?;
            for action in &job.actions {
                scheduler.add_action_unit(
                    &cadence,
                    action,
                    Some(tag.clone()),
                    &self.clients,
                    &self.pool,
                    correlation_id,
                )?;
            }
            Ok(())
        })();

        scheduler.remove_units_by_tag(&tag);
        outcome
    }

    /// Tear down every registered job; used at process shutdown.
    pub async fn shutdown(&self, correlation_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        for (name, scheduler) in registry.drain() {
            scheduler.shutdown();
            debug!(job = %name, correlation_id, "job stopped during manager shutdown");
        }
        info!(correlation_id, "all jobs stopped and removed from the scheduler manager");
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.registry.read().await.contains_key(name)
    }

    async fn get(&self, name: &str) -> Result<Arc<JobScheduler>> {
        let registry = self.registry.read().await;
        registry.get(name).cloned().ok_or_else(|| {
            SchedulerError::NotFound(format!("schedule job '{name}' does not exist"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::test_support::test_clients;
    use crate::model::{
        ActionKind, AdminState, DefKind, ScheduleAction, ScheduleDef,
    };
    use crate::storage;

    fn test_manager() -> (tempfile::TempDir, SchedulerManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        let (clients, _, _) = test_clients();
        (dir, SchedulerManager::new(clients, pool))
    }

    fn sample_job(name: &str) -> ScheduleJob {
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
            created: 1,
            modified: 1,
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_is_conflict() {
        let (_dir, manager) = test_manager();
        let job = sample_job("dup");
        manager.add_job(&job, "corr").await.unwrap();

        let err = manager.add_job(&job, "corr").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_operations_on_unknown_name_are_not_found() {
        let (_dir, manager) = test_manager();
        let job = sample_job("ghost");

        for err in [
            manager.update_job(&job, "corr").await.unwrap_err(),
            manager.delete_job_by_name("ghost", "corr").await.unwrap_err(),
            manager.start_job_by_name("ghost", "corr").await.unwrap_err(),
            manager.stop_job_by_name("ghost", "corr").await.unwrap_err(),
            manager.trigger_job_by_name("ghost", "corr").await.unwrap_err(),
        ] {
            assert!(matches!(err, SchedulerError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_contract_violations_before_registry() {
        let (_dir, manager) = test_manager();

        let mut nameless = sample_job("");
        nameless.id.clear();
        let err = manager.validate_job(&nameless, "corr").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ContractInvalid(_)));

        let mut no_actions = sample_job("no-actions");
        no_actions.actions.clear();
        let err = manager.validate_job(&no_actions, "corr").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ContractInvalid(_)));
    }

    #[tokio::test]
    async fn test_validate_leaves_no_tagged_units_behind() {
        let (_dir, manager) = test_manager();
        let job = sample_job("clean");
        manager.add_job(&job, "corr").await.unwrap();

        manager.validate_job(&job, "corr").await.unwrap();
        manager.validate_job(&job, "corr").await.unwrap();

        let scheduler = manager.get("clean").await.unwrap();
        assert_eq!(scheduler.unit_count(), job.actions.len());
    }

    #[tokio::test]
    async fn test_validate_cleans_up_after_a_bad_action() {
        let (_dir, manager) = test_manager();
        let job = sample_job("partial");
        manager.add_job(&job, "corr").await.unwrap();

        let mut bad = job.clone();
        bad.actions.push(ScheduleAction::rest("http://ok", "GET"));
        bad.actions.push(ScheduleAction::rest("http://bad", "BREW"));

        let err = manager.validate_job(&bad, "corr").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ContractInvalid(_)));

        // The good throwaway unit must not leak.
        let scheduler = manager.get("partial").await.unwrap();
        assert_eq!(scheduler.unit_count(), job.actions.len());
    }

    #[tokio::test]
    async fn test_trigger_on_locked_job_does_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        let (clients, bus, _) = test_clients();
        let manager = SchedulerManager::new(clients, pool);

        let mut job = sample_job("locked");
        job.admin_state = AdminState::Locked;
        manager.add_job(&job, "corr").await.unwrap();

        manager.trigger_job_by_name("locked", "corr").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_replaces_registration() {
        let (_dir, manager) = test_manager();
        let mut job = sample_job("upd");
        manager.add_job(&job, "corr").await.unwrap();

        job.actions.push(ScheduleAction::rest("http://x", "GET"));
        manager.update_job(&job, "corr").await.unwrap();

        let scheduler = manager.get("upd").await.unwrap();
        assert_eq!(scheduler.unit_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let (_dir, manager) = test_manager();
        manager.add_job(&sample_job("one"), "corr").await.unwrap();
        manager.add_job(&sample_job("two"), "corr").await.unwrap();

        manager.shutdown("corr").await.unwrap();
        assert!(!manager.contains("one").await);
        assert!(!manager.contains("two").await);
    }
}
