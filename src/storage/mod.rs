//! SQLite storage layer -- schema, queries, migrations.
//!
//! Jobs persist their definition and action list as JSON columns; records
//! persist the action snapshot the same way. All timestamps are epoch
//! milliseconds.

pub mod schema;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::errors::{Result, SchedulerError};
use crate::model::{now_millis, RunStatus, ScheduleActionRecord, ScheduleJob};

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

fn corrupt_row(context: &str, e: serde_json::Error) -> SchedulerError {
    SchedulerError::Database(format!("corrupt {context} column: {e}"))
}

// ---------------------------------------------------------------------------
// Schedule jobs
// ---------------------------------------------------------------------------

/// Insert a new job. Assigns an id and created/modified stamps when absent.
pub fn add_job(pool: &Pool, job: &ScheduleJob) -> Result<ScheduleJob> {
    let mut stored = job.clone();
    if stored.id.is_empty() {
        stored.id = uuid::Uuid::new_v4().to_string();
    }
    if stored.created == 0 {
        stored.created = now_millis();
    }
    if stored.modified == 0 {
        stored.modified = stored.created;
    }

    let definition_json =
        serde_json::to_string(&stored.definition).map_err(|e| corrupt_row("definition", e))?;
    let actions_json =
        serde_json::to_string(&stored.actions).map_err(|e| corrupt_row("actions", e))?;
    let labels_json =
        serde_json::to_string(&stored.labels).map_err(|e| corrupt_row("labels", e))?;

    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO schedule_jobs
         (id, name, definition_json, actions_json, admin_state,
          auto_trigger_missed, labels_json, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            stored.id,
            stored.name,
            definition_json,
            actions_json,
            stored.admin_state.to_string(),
            stored.auto_trigger_missed_records as i64,
            labels_json,
            stored.created,
            stored.modified,
        ],
    )?;
    if inserted == 0 {
        return Err(SchedulerError::Conflict(format!(
            "schedule job '{}' already exists",
            stored.name
        )));
    }

    Ok(stored)
}

/// Replace a job row in full, bumping its modified stamp.
pub fn update_job(pool: &Pool, job: &ScheduleJob) -> Result<ScheduleJob> {
    let mut stored = job.clone();
    stored.modified = now_millis();

    let definition_json =
        serde_json::to_string(&stored.definition).map_err(|e| corrupt_row("definition", e))?;
    let actions_json =
        serde_json::to_string(&stored.actions).map_err(|e| corrupt_row("actions", e))?;
    let labels_json =
        serde_json::to_string(&stored.labels).map_err(|e| corrupt_row("labels", e))?;

    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE schedule_jobs SET definition_json = ?1, actions_json = ?2,
             admin_state = ?3, auto_trigger_missed = ?4, labels_json = ?5,
             modified = ?6
         WHERE name = ?7",
        params![
            definition_json,
            actions_json,
            stored.admin_state.to_string(),
            stored.auto_trigger_missed_records as i64,
            labels_json,
            stored.modified,
            stored.name,
        ],
    )?;
    if changed == 0 {
        return Err(SchedulerError::NotFound(format!(
            "schedule job '{}' does not exist",
            stored.name
        )));
    }

    Ok(stored)
}

pub fn delete_job_by_name(pool: &Pool, name: &str) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute("DELETE FROM schedule_jobs WHERE name = ?1", params![name])?;
    if changed == 0 {
        return Err(SchedulerError::NotFound(format!(
            "schedule job '{name}' does not exist"
        )));
    }
    Ok(())
}

const JOB_COLUMNS: &str = "id, name, definition_json, actions_json, admin_state,
     auto_trigger_missed, labels_json, created, modified";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ScheduleJob, String, String, String)> {
    let admin_state: String = row.get(4)?;
    Ok((
        ScheduleJob {
            id: row.get(0)?,
            name: row.get(1)?,
            definition: crate::model::ScheduleDef {
                start_timestamp: None,
                end_timestamp: None,
                kind: crate::model::DefKind::Interval {
                    interval: String::new(),
                },
            },
            actions: Vec::new(),
            admin_state: admin_state.parse().unwrap_or(crate::model::AdminState::Locked),
            auto_trigger_missed_records: row.get::<_, i64>(5)? != 0,
            labels: Vec::new(),
            created: row.get(7)?,
            modified: row.get(8)?,
        },
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(6)?,
    ))
}

fn finish_job(parts: (ScheduleJob, String, String, String)) -> Result<ScheduleJob> {
    let (mut job, definition_json, actions_json, labels_json) = parts;
    job.definition =
        serde_json::from_str(&definition_json).map_err(|e| corrupt_row("definition", e))?;
    job.actions = serde_json::from_str(&actions_json).map_err(|e| corrupt_row("actions", e))?;
    job.labels = serde_json::from_str(&labels_json).map_err(|e| corrupt_row("labels", e))?;
    Ok(job)
}

pub fn job_by_name(pool: &Pool, name: &str) -> Result<ScheduleJob> {
    let conn = pool.get()?;
    let parts = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE name = ?1"),
            params![name],
            row_to_job,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SchedulerError::NotFound(format!("schedule job '{name}' does not exist"))
            }
            other => other.into(),
        })?;
    finish_job(parts)
}

pub fn job_by_id(pool: &Pool, id: &str) -> Result<ScheduleJob> {
    let conn = pool.get()?;
    let parts = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SchedulerError::NotFound(format!("schedule job with id '{id}' does not exist"))
            }
            other => other.into(),
        })?;
    finish_job(parts)
}

/// All jobs ordered by creation time, optionally filtered to those carrying
/// every requested label, with offset/limit paging applied after filtering.
pub fn all_jobs(
    pool: &Pool,
    labels: &[String],
    offset: usize,
    limit: usize,
) -> Result<Vec<ScheduleJob>> {
    let jobs = load_jobs_filtered(pool, labels)?;
    Ok(jobs.into_iter().skip(offset).take(limit).collect())
}

pub fn job_total_count(pool: &Pool, labels: &[String]) -> Result<u64> {
    if labels.is_empty() {
        let conn = pool.get()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM schedule_jobs", [], |row| row.get(0))?;
        return Ok(count as u64);
    }
    Ok(load_jobs_filtered(pool, labels)?.len() as u64)
}

fn load_jobs_filtered(pool: &Pool, labels: &[String]) -> Result<Vec<ScheduleJob>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM schedule_jobs ORDER BY created"
    ))?;
    let rows = stmt.query_map([], row_to_job)?;

    let mut jobs = Vec::new();
    for row in rows {
        let job = finish_job(row?)?;
        if labels.iter().all(|l| job.labels.contains(l)) {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

// ---------------------------------------------------------------------------
// Action records
// ---------------------------------------------------------------------------

/// Persist one record, stamping id and creation time when absent.
pub fn add_record(pool: &Pool, record: &ScheduleActionRecord) -> Result<ScheduleActionRecord> {
    let mut stored = record.clone();
    if stored.id.is_empty() {
        stored.id = uuid::Uuid::new_v4().to_string();
    }
    if stored.created == 0 {
        stored.created = now_millis();
    }

    let action_json =
        serde_json::to_string(&stored.action).map_err(|e| corrupt_row("action", e))?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO action_records
         (id, job_name, action_id, action_json, status, scheduled_at, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            stored.id,
            stored.job_name,
            stored.action.id,
            action_json,
            stored.status.to_string(),
            stored.scheduled_at,
            stored.created,
        ],
    )?;

    Ok(stored)
}

/// Persist a batch of records in one transaction (missed-run backfill).
pub fn add_records(pool: &Pool, records: &[ScheduleActionRecord]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let created = now_millis();

    for record in records {
        let id = if record.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id.clone()
        };
        let action_json =
            serde_json::to_string(&record.action).map_err(|e| corrupt_row("action", e))?;
        tx.execute(
            "INSERT INTO action_records
             (id, job_name, action_id, action_json, status, scheduled_at, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                record.job_name,
                record.action.id,
                action_json,
                record.status.to_string(),
                record.scheduled_at,
                if record.created == 0 { created } else { record.created },
            ],
        )?;
    }

    tx.commit()?;
    Ok(records.len())
}

/// Record query filters. Time bounds apply to the persistence timestamp;
/// an `end` of zero means unbounded.
#[derive(Debug, Clone, Copy)]
pub enum RecordFilter<'a> {
    All,
    Status(RunStatus),
    Job(&'a str),
    JobAndStatus(&'a str, RunStatus),
}

fn filter_clause(filter: RecordFilter<'_>) -> (String, Vec<String>) {
    match filter {
        RecordFilter::All => (String::new(), vec![]),
        RecordFilter::Status(s) => ("AND status = ?3".to_string(), vec![s.to_string()]),
        RecordFilter::Job(j) => ("AND job_name = ?3".to_string(), vec![j.to_string()]),
        RecordFilter::JobAndStatus(j, s) => (
            "AND job_name = ?3 AND status = ?4".to_string(),
            vec![j.to_string(), s.to_string()],
        ),
    }
}

const RECORD_COLUMNS: &str = "id, job_name, action_json, status, scheduled_at, created";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ScheduleActionRecord, String)> {
    let status: String = row.get(3)?;
    Ok((
        ScheduleActionRecord {
            id: row.get(0)?,
            job_name: row.get(1)?,
            action: crate::model::ScheduleAction::rest("", ""),
            status: status.parse().unwrap_or(RunStatus::Failed),
            scheduled_at: row.get(4)?,
            created: row.get(5)?,
        },
        row.get::<_, String>(2)?,
    ))
}

fn finish_record(parts: (ScheduleActionRecord, String)) -> Result<ScheduleActionRecord> {
    let (mut record, action_json) = parts;
    record.action = serde_json::from_str(&action_json).map_err(|e| corrupt_row("action", e))?;
    Ok(record)
}

/// Paged, time-ranged record query, newest first.
pub fn records(
    pool: &Pool,
    filter: RecordFilter<'_>,
    start: i64,
    end: i64,
    offset: usize,
    limit: usize,
) -> Result<Vec<ScheduleActionRecord>> {
    let end = if end <= 0 { i64::MAX } else { end };
    let (clause, extra) = filter_clause(filter);
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM action_records
         WHERE created >= ?1 AND created <= ?2 {clause}
         ORDER BY created DESC LIMIT {limit} OFFSET {offset}"
    );

    let conn = pool.get()?;
    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(start), Box::new(end)];
    for value in extra {
        params.push(Box::new(value));
    }
    let refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(refs.as_slice(), row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(finish_record(row?)?);
    }
    Ok(records)
}

/// Total record count under a filter, unbounded in time.
pub fn record_count(pool: &Pool, filter: RecordFilter<'_>) -> Result<u64> {
    record_count_in_range(pool, filter, 0, 0)
}

/// Record count under a filter within `[start, end]` on the persistence
/// timestamp; an `end` of zero means unbounded.
pub fn record_count_in_range(
    pool: &Pool,
    filter: RecordFilter<'_>,
    start: i64,
    end: i64,
) -> Result<u64> {
    let end = if end <= 0 { i64::MAX } else { end };
    let (clause, extra) = filter_clause(filter);
    let sql = format!(
        "SELECT COUNT(*) FROM action_records WHERE created >= ?1 AND created <= ?2 {clause}"
    );

    let conn = pool.get()?;
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(start), Box::new(end)];
    for value in extra {
        params.push(Box::new(value));
    }
    let refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let count: i64 = conn.query_row(&sql, refs.as_slice(), |row| row.get(0))?;
    Ok(count as u64)
}

/// The most recent record for each action of one job.
pub fn latest_records_by_job(pool: &Pool, job_name: &str) -> Result<Vec<ScheduleActionRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT r.{}
         FROM action_records r
         JOIN (SELECT action_id, MAX(created) AS latest
               FROM action_records WHERE job_name = ?1
               GROUP BY action_id) m
           ON r.action_id = m.action_id AND r.created = m.latest
         WHERE r.job_name = ?1
         ORDER BY r.created DESC",
        RECORD_COLUMNS.replace(", ", ", r.")
    ))?;
    let rows = stmt.query_map(params![job_name], row_to_record)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(finish_record(row?)?);
    }
    Ok(records)
}

/// The most recent record per (job, action) across all jobs, paged.
pub fn latest_records(pool: &Pool, offset: usize, limit: usize) -> Result<Vec<ScheduleActionRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT r.{}
         FROM action_records r
         JOIN (SELECT job_name, action_id, MAX(created) AS latest
               FROM action_records
               GROUP BY job_name, action_id) m
           ON r.job_name = m.job_name AND r.action_id = m.action_id
              AND r.created = m.latest
         ORDER BY r.created DESC LIMIT {limit} OFFSET {offset}",
        RECORD_COLUMNS.replace(", ", ", r.")
    ))?;
    let rows = stmt.query_map([], row_to_record)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(finish_record(row?)?);
    }
    Ok(records)
}

/// The record at `offset` from the newest end, i.e. the boundary separating
/// the newest `offset` records from the rest. Used by the retention purger.
pub fn latest_record_by_offset(pool: &Pool, offset: usize) -> Result<Option<ScheduleActionRecord>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM action_records
             ORDER BY created DESC LIMIT 1 OFFSET {offset}"
        ),
        [],
        row_to_record,
    );
    match result {
        Ok(parts) => Ok(Some(finish_record(parts)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete all records older than `age_ms` milliseconds. Returns the number
/// of rows removed.
pub fn delete_records_by_age(pool: &Pool, age_ms: i64) -> Result<usize> {
    if age_ms < 0 {
        return Err(SchedulerError::ContractInvalid(
            "age must be non-negative".to_string(),
        ));
    }
    let cutoff = now_millis() - age_ms;
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM action_records WHERE created < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
