//! Trigger definitions and their parsed cadence form.

use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};

use super::from_millis;

/// When a job fires: a fixed interval or a cron expression, with an optional
/// start/end wall-clock window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDef {
    /// Epoch milliseconds. Past start means the first run is immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    /// Epoch milliseconds. An elapsed end freezes the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    #[serde(flatten)]
    pub kind: DefKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DefKind {
    /// Fixed interval, e.g. "10s", "1h30m".
    Interval { interval: String },
    /// 5-field cron expression with an optional leading seconds field.
    /// A `TZ=`/`CRON_TZ=` prefix (or the explicit timezone) selects the
    /// zone; otherwise the local timezone applies.
    Cron {
        crontab: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

impl ScheduleDef {
    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start_timestamp.and_then(from_millis)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.end_timestamp.and_then(from_millis)
    }

    /// Parse the definition into its executable cadence. Parse failure is a
    /// contract error, never fatal.
    pub fn parse(&self) -> Result<Cadence> {
        match &self.kind {
            DefKind::Interval { interval } => {
                let trimmed = interval.trim();
                if trimmed.is_empty() {
                    return Err(SchedulerError::ContractInvalid(
                        "interval duration is empty".to_string(),
                    ));
                }
                let duration = humantime::parse_duration(trimmed).map_err(|e| {
                    SchedulerError::ContractInvalid(format!(
                        "invalid interval duration '{trimmed}': {e}"
                    ))
                })?;
                if duration.is_zero() {
                    return Err(SchedulerError::ContractInvalid(
                        "interval duration must be non-zero".to_string(),
                    ));
                }
                Ok(Cadence::Interval(duration))
            }
            DefKind::Cron { crontab, timezone } => parse_cron(crontab, timezone.as_deref()),
        }
    }
}

/// Executable form of a definition.
#[derive(Debug, Clone)]
pub enum Cadence {
    Interval(std::time::Duration),
    Cron {
        schedule: cron::Schedule,
        zone: CronZone,
    },
}

/// Zone a cron schedule is evaluated in.
#[derive(Debug, Clone, Copy)]
pub enum CronZone {
    Local,
    Named(chrono_tz::Tz),
}

impl Cadence {
    /// The next fire instant strictly after `t`, or `None` when the cron
    /// schedule has no future occurrence.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(d) => {
                let step = chrono::Duration::from_std(*d).ok()?;
                t.checked_add_signed(step)
            }
            Cadence::Cron { schedule, zone } => match zone {
                CronZone::Local => schedule
                    .after(&t.with_timezone(&Local))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc)),
                CronZone::Named(tz) => schedule
                    .after(&t.with_timezone(tz))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc)),
            },
        }
    }
}

/// Parse a cron expression, honoring a `TZ=`/`CRON_TZ=` prefix and
/// normalizing 5-field expressions to the 6-field (seconds-first) form the
/// cron parser expects.
fn parse_cron(crontab: &str, timezone: Option<&str>) -> Result<Cadence> {
    let trimmed = crontab.trim();
    if trimmed.is_empty() {
        return Err(SchedulerError::ContractInvalid(
            "cron expression is empty".to_string(),
        ));
    }

    let (zone_name, expr) = split_zone_prefix(trimmed);
    let zone = match zone_name.or(timezone) {
        Some(name) => {
            let tz: chrono_tz::Tz = name.parse().map_err(|_| {
                SchedulerError::ContractInvalid(format!("unknown timezone '{name}'"))
            })?;
            CronZone::Named(tz)
        }
        None => CronZone::Local,
    };

    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        n => {
            return Err(SchedulerError::ContractInvalid(format!(
                "cron expression '{expr}' has {n} fields, expected 5 or 6"
            )))
        }
    };

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
        SchedulerError::ContractInvalid(format!("invalid cron expression '{expr}': {e}"))
    })?;

    Ok(Cadence::Cron { schedule, zone })
}

fn split_zone_prefix(expr: &str) -> (Option<&str>, &str) {
    for prefix in ["CRON_TZ=", "TZ="] {
        if let Some(rest) = expr.strip_prefix(prefix) {
            if let Some((zone, tail)) = rest.split_once(char::is_whitespace) {
                return (Some(zone), tail.trim_start());
            }
            return (Some(rest), "");
        }
    }
    (None, expr)
}
