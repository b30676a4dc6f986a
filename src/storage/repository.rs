use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util::{format_date, format_timestamp, parse_timestamp, DATE_FORMAT};
use crate::metrics::{
    CourseDailyMetrics, MetricValues, NewPipelineError, PipelineErrorRecord,
    BACKFILL_THRESHOLD_DAYS,
};

// ── Course Daily Metrics ───────────────────────────────────────────

const METRICS_COLUMNS: &str = "id, site, course_id, date_for, enrollment_count, active_learners_today,
     average_progress, average_days_to_complete, num_learners_completed, created, modified";

pub fn get_daily_metrics(
    conn: &Connection,
    site: &str,
    course_id: &str,
    date_for: NaiveDate,
) -> Result<Option<CourseDailyMetrics>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {METRICS_COLUMNS} FROM course_daily_metrics
             WHERE site = ?1 AND course_id = ?2 AND date_for = ?3"
        ),
        params![site, course_id, format_date(date_for)],
        row_to_metrics,
    )
    .optional()
}

/// Plain insert. Fails with a UNIQUE constraint violation if a record for the
/// key already exists.
pub fn insert_daily_metrics(
    conn: &Connection,
    site: &str,
    course_id: &str,
    date_for: NaiveDate,
    values: &MetricValues,
    now: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    let now = format_timestamp(now);
    conn.execute(
        "INSERT INTO course_daily_metrics (
            site, course_id, date_for, enrollment_count, active_learners_today,
            average_progress, average_days_to_complete, num_learners_completed,
            created, modified
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            site,
            course_id,
            format_date(date_for),
            values.enrollment_count as i64,
            values.active_learners_today as i64,
            values.average_progress,
            values.average_days_to_complete,
            values.num_learners_completed as i64,
            now,
        ],
    )?;
    Ok(())
}

/// Overwrite the computed fields of an existing record. `created` is left untouched.
pub fn update_daily_metrics(
    conn: &Connection,
    site: &str,
    course_id: &str,
    date_for: NaiveDate,
    values: &MetricValues,
    now: DateTime<Utc>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE course_daily_metrics SET
            enrollment_count = ?4, active_learners_today = ?5,
            average_progress = ?6, average_days_to_complete = ?7,
            num_learners_completed = ?8, modified = ?9
         WHERE site = ?1 AND course_id = ?2 AND date_for = ?3",
        params![
            site,
            course_id,
            format_date(date_for),
            values.enrollment_count as i64,
            values.active_learners_today as i64,
            values.average_progress,
            values.average_days_to_complete,
            values.num_learners_completed as i64,
            format_timestamp(now),
        ],
    )
}

/// Insert the record, or update it in place when the key already exists.
/// The uniqueness constraint decides which path is taken, so two writers
/// racing on the same key can never produce a duplicate.
/// Returns the stored record and whether it was newly created.
pub fn upsert_daily_metrics(
    conn: &Connection,
    site: &str,
    course_id: &str,
    date_for: NaiveDate,
    values: &MetricValues,
    now: DateTime<Utc>,
) -> Result<(CourseDailyMetrics, bool), rusqlite::Error> {
    let created = match insert_daily_metrics(conn, site, course_id, date_for, values, now) {
        Ok(()) => true,
        Err(e) if is_unique_violation(&e) => {
            update_daily_metrics(conn, site, course_id, date_for, values, now)?;
            false
        }
        Err(e) => return Err(e),
    };
    let record = get_daily_metrics(conn, site, course_id, date_for)?
        .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    Ok((record, created))
}

#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub site: String,
    pub course_id: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub limit: u32,
}

pub fn list_daily_metrics(
    conn: &Connection,
    filter: &MetricsFilter,
) -> Result<Vec<CourseDailyMetrics>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {METRICS_COLUMNS} FROM course_daily_metrics
         WHERE site = ?1
           AND (?2 IS NULL OR course_id = ?2)
           AND (?3 IS NULL OR date_for >= ?3)
           AND (?4 IS NULL OR date_for <= ?4)
         ORDER BY date_for, course_id
         LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.site,
            filter.course_id,
            filter.start.map(format_date),
            filter.end.map(format_date),
            filter.limit as i64,
        ],
        row_to_metrics,
    )?;
    rows.collect()
}

fn row_to_metrics(row: &Row<'_>) -> Result<CourseDailyMetrics, rusqlite::Error> {
    Ok(CourseDailyMetrics {
        id: row.get(0)?,
        site: row.get(1)?,
        course_id: row.get(2)?,
        date_for: date_column(row, 3)?,
        values: MetricValues {
            enrollment_count: row.get::<_, i64>(4)? as u64,
            active_learners_today: row.get::<_, i64>(5)? as u64,
            average_progress: row.get(6)?,
            average_days_to_complete: row.get(7)?,
            num_learners_completed: row.get::<_, i64>(8)? as u64,
        },
        created: timestamp_column(row, 9)?,
        modified: timestamp_column(row, 10)?,
    })
}

// ── Backfill Artifacts ─────────────────────────────────────────────

/// Records stored more than the backfill threshold after the day they describe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillSummary {
    pub count: u64,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    pub courses: Vec<String>,
}

fn backfill_threshold_modifier() -> String {
    format!("+{BACKFILL_THRESHOLD_DAYS} days")
}

pub fn summarize_backfill_artifacts(
    conn: &Connection,
    site: &str,
) -> Result<BackfillSummary, rusqlite::Error> {
    let modifier = backfill_threshold_modifier();
    let (count, earliest, latest): (i64, Option<String>, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MIN(date_for), MAX(date_for) FROM course_daily_metrics
         WHERE site = ?1 AND created > datetime(date_for, ?2)",
        params![site, modifier],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT course_id FROM course_daily_metrics
         WHERE site = ?1 AND created > datetime(date_for, ?2)
         ORDER BY course_id",
    )?;
    let courses = stmt
        .query_map(params![site, modifier], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let parse = |raw: Option<String>| raw.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok());
    Ok(BackfillSummary {
        count: count as u64,
        earliest: parse(earliest),
        latest: parse(latest),
        courses,
    })
}

/// Null out `average_progress` on every backfill artifact of the site.
/// No other column is touched.
pub fn clear_backfilled_progress(conn: &Connection, site: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE course_daily_metrics SET average_progress = NULL
         WHERE site = ?1 AND created > datetime(date_for, ?2)",
        params![site, backfill_threshold_modifier()],
    )
}

// ── Pipeline Errors ────────────────────────────────────────────────

pub fn insert_pipeline_error(
    conn: &Connection,
    site: &str,
    error: &NewPipelineError,
    now: DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO pipeline_errors (error_type, site, user_identity, course_id, date_for, error_data, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            error.kind.as_str(),
            site,
            error.user_identity,
            error.course_id,
            format_date(error.date_for),
            error.data.to_string(),
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, Default)]
pub struct PipelineErrorFilter {
    pub site: Option<String>,
    pub course_id: Option<String>,
    pub date_for: Option<NaiveDate>,
    pub limit: u32,
}

pub fn list_pipeline_errors(
    conn: &Connection,
    filter: &PipelineErrorFilter,
) -> Result<Vec<PipelineErrorRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, error_type, site, user_identity, course_id, date_for, error_data, created
         FROM pipeline_errors
         WHERE (?1 IS NULL OR site = ?1)
           AND (?2 IS NULL OR course_id = ?2)
           AND (?3 IS NULL OR date_for = ?3)
         ORDER BY id DESC
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![
            filter.site,
            filter.course_id,
            filter.date_for.map(format_date),
            filter.limit as i64,
        ],
        |row| {
            Ok(PipelineErrorRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                site: row.get(2)?,
                user_identity: row.get(3)?,
                course_id: row.get(4)?,
                date_for: optional_date_column(row, 5)?,
                data: json_column(row, 6)?,
                created: timestamp_column(row, 7)?,
            })
        },
    )?;
    rows.collect()
}

pub fn count_pipeline_errors(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM pipeline_errors", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Delete error records created before the start of `before`.
pub fn prune_pipeline_errors(conn: &Connection, before: NaiveDate) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM pipeline_errors WHERE created < ?1",
        params![format!("{} 00:00:00", format_date(before))],
    )
}

// ── Pipeline Runs ──────────────────────────────────────────────────

pub fn insert_pipeline_run(
    conn: &Connection,
    site: &str,
    date_for: NaiveDate,
    force_update: bool,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO pipeline_runs (site, date_for, force_update, status, started_at)
         VALUES (?1, ?2, ?3, 'running', datetime('now'))",
        params![site, format_date(date_for), force_update as i32],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_pipeline_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    courses_total: u64,
    courses_succeeded: u64,
    courses_failed: u64,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE pipeline_runs SET
            status = ?2, completed_at = datetime('now'),
            courses_total = ?3, courses_succeeded = ?4, courses_failed = ?5,
            error_message = ?6
         WHERE id = ?1",
        params![
            run_id,
            status,
            courses_total as i64,
            courses_succeeded as i64,
            courses_failed as i64,
            error_message,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: i64,
    pub site: String,
    pub date_for: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub courses_total: u64,
    pub courses_succeeded: u64,
    pub courses_failed: u64,
}

/// Most recent run that reached completion.
pub fn last_pipeline_run(conn: &Connection) -> Result<Option<PipelineRun>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, site, date_for, status, started_at, completed_at,
                courses_total, courses_succeeded, courses_failed
         FROM pipeline_runs WHERE completed_at IS NOT NULL
         ORDER BY id DESC LIMIT 1",
        [],
        |row| {
            Ok(PipelineRun {
                id: row.get(0)?,
                site: row.get(1)?,
                date_for: row.get(2)?,
                status: row.get(3)?,
                started_at: row.get(4)?,
                completed_at: row.get(5)?,
                courses_total: row.get::<_, i64>(6)? as u64,
                courses_succeeded: row.get::<_, i64>(7)? as u64,
                courses_failed: row.get::<_, i64>(8)? as u64,
            })
        },
    )
    .optional()
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarehouseStatus {
    pub metric_records: u64,
    pub sites: u64,
    pub courses: u64,
    pub earliest_date: Option<String>,
    pub latest_date: Option<String>,
    pub pipeline_errors: u64,
    pub pipeline_runs: u64,
    pub last_run: Option<PipelineRun>,
}

pub fn warehouse_status(conn: &Connection) -> Result<WarehouseStatus, rusqlite::Error> {
    let (metric_records, sites, courses, earliest_date, latest_date): (i64, i64, i64, Option<String>, Option<String>) =
        conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT site), COUNT(DISTINCT site || ' ' || course_id),
                    MIN(date_for), MAX(date_for)
             FROM course_daily_metrics",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
    let pipeline_runs: i64 =
        conn.query_row("SELECT COUNT(*) FROM pipeline_runs", [], |row| row.get(0))?;

    Ok(WarehouseStatus {
        metric_records: metric_records as u64,
        sites: sites as u64,
        courses: courses as u64,
        earliest_date,
        latest_date,
        pipeline_errors: count_pipeline_errors(conn)?,
        pipeline_runs: pipeline_runs as u64,
        last_run: last_pipeline_run(conn)?,
    })
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn date_column(row: &Row<'_>, idx: usize) -> Result<NaiveDate, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_date_column(row: &Row<'_>, idx: usize) -> Result<Option<NaiveDate>, rusqlite::Error> {
    match row.get_ref(idx)? {
        rusqlite::types::ValueRef::Null => Ok(None),
        _ => date_column(row, idx).map(Some),
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> Result<serde_json::Value, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}
