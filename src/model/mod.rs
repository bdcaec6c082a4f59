//! Domain model -- schedule jobs, trigger definitions, actions, and
//! execution records.

pub mod action;
pub mod definition;
pub mod record;

pub use action::{assign_action_ids, ActionKind, AuthMethod, ScheduleAction};
pub use definition::{Cadence, DefKind, ScheduleDef};
pub use record::{RunStatus, ScheduleActionRecord};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};

/// Administrative state of a job. A Locked job is stored but never scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdminState {
    Locked,
    Unlocked,
}

impl std::fmt::Display for AdminState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminState::Locked => write!(f, "LOCKED"),
            AdminState::Unlocked => write!(f, "UNLOCKED"),
        }
    }
}

impl std::str::FromStr for AdminState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LOCKED" => Ok(AdminState::Locked),
            "UNLOCKED" => Ok(AdminState::Unlocked),
            other => Err(format!("unknown admin state: {other}")),
        }
    }
}

/// A named, independently lifecycled unit combining one trigger definition
/// and one or more actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJob {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub definition: ScheduleDef,
    pub actions: Vec<ScheduleAction>,
    #[serde(default = "default_admin_state")]
    pub admin_state: AdminState,
    #[serde(default)]
    pub auto_trigger_missed_records: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub created: i64,
    /// Epoch milliseconds. A definition edit bumps this, which invalidates
    /// pre-edit history for backfill purposes.
    #[serde(default)]
    pub modified: i64,
}

fn default_admin_state() -> AdminState {
    AdminState::Unlocked
}

impl ScheduleJob {
    /// Whether the job's end window has already elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.definition.end_at() {
            Some(end) => end <= now,
            None => false,
        }
    }

    /// Locked jobs and jobs whose end timestamp has elapsed are never
    /// triggered; the scheduler instance is still created so future updates
    /// have something to replace.
    pub fn is_triggerable(&self, now: DateTime<Utc>) -> bool {
        self.admin_state == AdminState::Unlocked && !self.is_expired(now)
    }

    /// Contract-level checks shared by add, patch, and validate: a job needs
    /// an identity and at least one action. Definition and per-action
    /// constructibility are proven separately through the real construction
    /// path.
    pub fn check_identity(&self) -> Result<()> {
        if self.name.is_empty() && self.id.is_empty() {
            return Err(SchedulerError::ContractInvalid(
                "job name and id are both empty".to_string(),
            ));
        }
        if self.actions.is_empty() {
            return Err(SchedulerError::ContractInvalid(format!(
                "job {} has no actions",
                self.name
            )));
        }
        Ok(())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC instant.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_job(name: &str) -> ScheduleJob {
        ScheduleJob {
            id: "id-1".to_string(),
            name: name.to_string(),
            definition: ScheduleDef {
                start_timestamp: None,
                end_timestamp: None,
                kind: DefKind::Interval {
                    interval: "10s".to_string(),
                },
            },
            actions: vec![ScheduleAction::rest("http://x", "GET")],
            admin_state: AdminState::Unlocked,
            auto_trigger_missed_records: false,
            labels: vec![],
            created: 0,
            modified: 0,
        }
    }

    #[test]
    fn test_locked_job_not_triggerable() {
        let mut job = interval_job("j");
        job.admin_state = AdminState::Locked;
        assert!(!job.is_triggerable(Utc::now()));
    }

    #[test]
    fn test_expired_job_not_triggerable() {
        let mut job = interval_job("j");
        job.definition.end_timestamp = Some(now_millis() - 1_000);
        assert!(job.is_expired(Utc::now()));
        assert!(!job.is_triggerable(Utc::now()));
    }

    #[test]
    fn test_identity_check_rejects_empty() {
        let mut job = interval_job("");
        job.id.clear();
        assert!(job.check_identity().is_err());

        let mut job = interval_job("j");
        job.actions.clear();
        assert!(job.check_identity().is_err());
    }
}
