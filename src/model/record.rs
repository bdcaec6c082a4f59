//! Execution history -- one immutable record per real or backfilled firing
//! of one action.

use serde::{Deserialize, Serialize};

use super::ScheduleAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// A trigger instant that should have fired while the service was not
    /// running, backfilled at startup.
    Missed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "SUCCEEDED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Missed => write!(f, "MISSED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            "MISSED" => Ok(RunStatus::Missed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Append-only history entry. The only mutation path is bulk deletion by age
/// during retention purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleActionRecord {
    #[serde(default)]
    pub id: String,
    pub job_name: String,
    /// Deep copy of the action as it was at fire time.
    pub action: ScheduleAction,
    pub status: RunStatus,
    /// Epoch milliseconds of the instant the run was due.
    pub scheduled_at: i64,
    /// Epoch milliseconds of persistence time.
    #[serde(default)]
    pub created: i64,
}

impl ScheduleActionRecord {
    pub fn new(
        job_name: &str,
        action: ScheduleAction,
        status: RunStatus,
        scheduled_at: i64,
    ) -> Self {
        ScheduleActionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            action,
            status,
            scheduled_at,
            created: 0,
        }
    }
}
