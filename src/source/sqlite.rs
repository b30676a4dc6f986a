use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    Completion, CourseAccessRole, CourseRole, Enrollment, LearnerSource, SiteResolver,
    SourceError, SourceResult,
};
use crate::course_key::CourseKey;
use crate::date_util::{format_date, format_timestamp, next_day, parse_timestamp, start_of_day};

/// Learner source backed by an SQLite snapshot of the learning platform.
///
/// The connection is guarded by a mutex so one source can be shared by the
/// extraction workers of several courses.
pub struct SqliteSource {
    conn: Mutex<Connection>,
}

impl SqliteSource {
    /// Open an existing snapshot database.
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an empty in-memory snapshot with the schema applied (for testing
    /// and for building snapshots programmatically).
    pub fn open_memory() -> SourceResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> SourceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SourceError::Other("source connection lock poisoned".into()))
    }

    /// Run a closure against the underlying connection.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> SourceResult<R> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    // ── Snapshot writers ───────────────────────────────────────────

    pub fn add_site(&self, site: &str, course_ids: &[&str]) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sites (site) VALUES (?1)",
                params![site],
            )?;
            for course_id in course_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO site_courses (site, course_id) VALUES (?1, ?2)",
                    params![site, course_id],
                )?;
            }
            Ok(())
        })
    }

    pub fn add_enrollment(
        &self,
        user_identity: &str,
        course_id: &str,
        created: DateTime<Utc>,
        is_active: bool,
    ) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO course_enrollments (user_identity, course_id, created, is_active)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_identity, course_id, format_timestamp(created), is_active as i32],
            )?;
            Ok(())
        })
    }

    pub fn add_role(&self, user_identity: &str, course_id: &str, role: &str) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO course_access_roles (user_identity, course_id, role)
                 VALUES (?1, ?2, ?3)",
                params![user_identity, course_id, role],
            )?;
            Ok(())
        })
    }

    pub fn add_activity(
        &self,
        user_identity: &str,
        course_id: &str,
        module_id: Option<&str>,
        modified: DateTime<Utc>,
    ) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO learner_activity (user_identity, course_id, module_id, modified)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_identity, course_id, module_id, format_timestamp(modified)],
            )?;
            Ok(())
        })
    }

    pub fn set_progress(
        &self,
        user_identity: &str,
        course_id: &str,
        as_of: NaiveDate,
        progress: f64,
    ) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO learner_progress (user_identity, course_id, as_of, progress)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_identity, course_id, format_date(as_of), progress],
            )?;
            Ok(())
        })
    }

    pub fn add_certificate(
        &self,
        user_identity: &str,
        course_id: &str,
        created: DateTime<Utc>,
    ) -> SourceResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO certificates (user_identity, course_id, created) VALUES (?1, ?2, ?3)",
                params![user_identity, course_id, format_timestamp(created)],
            )?;
            Ok(())
        })
    }
}

/// Apply the snapshot schema to a connection. Idempotent.
pub fn create_schema(conn: &Connection) -> SourceResult<()> {
    conn.execute_batch(include_str!("lms_schema.sql"))?;
    Ok(())
}

fn parse_stored_timestamp(raw: &str, what: &str) -> SourceResult<DateTime<Utc>> {
    parse_timestamp(raw)
        .ok_or_else(|| SourceError::InvalidData(format!("unparseable {what} timestamp '{raw}'")))
}

fn query_enrollments(
    conn: &Connection,
    course_id: &CourseKey,
    created_before: DateTime<Utc>,
    active_only: bool,
) -> SourceResult<Vec<Enrollment>> {
    let mut stmt = conn.prepare(
        "SELECT user_identity, created, is_active FROM course_enrollments
         WHERE course_id = ?1 AND datetime(created) < ?2 AND (?3 = 0 OR is_active = 1)
         ORDER BY created, id",
    )?;
    let rows = stmt.query_map(
        params![course_id.to_string(), format_timestamp(created_before), active_only],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        },
    )?;

    let mut enrollments = Vec::new();
    for row in rows {
        let (user_identity, created, is_active) = row?;
        enrollments.push(Enrollment {
            created: parse_stored_timestamp(&created, "enrollment")?,
            user_identity,
            course_id: course_id.clone(),
            is_active,
        });
    }
    Ok(enrollments)
}

impl LearnerSource for SqliteSource {
    fn enrollments_for(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>> {
        let conn = self.lock()?;
        query_enrollments(&conn, course_id, created_before, true)
    }

    fn enrollment_history(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>> {
        let conn = self.lock()?;
        query_enrollments(&conn, course_id, created_before, false)
    }

    fn roles_for(&self, course_id: &CourseKey) -> SourceResult<Vec<CourseAccessRole>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_identity, role FROM course_access_roles WHERE course_id = ?1",
        )?;
        let rows = stmt.query_map(params![course_id.to_string()], |row| {
            Ok(CourseAccessRole {
                user_identity: row.get(0)?,
                role: CourseRole::parse(&row.get::<_, String>(1)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn progress_fraction(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
        as_of: NaiveDate,
    ) -> SourceResult<f64> {
        let conn = self.lock()?;
        let progress: Option<f64> = conn
            .query_row(
                "SELECT progress FROM learner_progress
                 WHERE user_identity = ?1 AND course_id = ?2 AND as_of <= ?3
                 ORDER BY as_of DESC LIMIT 1",
                params![user_identity, course_id.to_string(), format_date(as_of)],
                |row| row.get(0),
            )
            .optional()?;

        // No snapshot yet: the learner has not made measurable progress.
        let progress = progress.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&progress) {
            return Err(SourceError::InvalidData(format!(
                "progress {progress} for {user_identity} in {course_id} is outside [0, 1]"
            )));
        }
        Ok(progress)
    }

    fn last_activity(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
    ) -> SourceResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(datetime(modified)) FROM learner_activity
             WHERE user_identity = ?1 AND course_id = ?2",
            params![user_identity, course_id.to_string()],
            |row| row.get(0),
        )?;
        latest
            .map(|raw| parse_stored_timestamp(&raw, "activity"))
            .transpose()
    }

    fn completions_for(
        &self,
        course_id: &CourseKey,
        completed_on_or_before: NaiveDate,
    ) -> SourceResult<Vec<Completion>> {
        let conn = self.lock()?;
        let cutoff = format_timestamp(start_of_day(next_day(completed_on_or_before)));
        let mut stmt = conn.prepare(
            "SELECT user_identity, created FROM certificates
             WHERE course_id = ?1 AND datetime(created) < ?2
             ORDER BY created, id",
        )?;
        let rows = stmt.query_map(params![course_id.to_string(), cutoff], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut completions = Vec::new();
        for row in rows {
            let (user_identity, created) = row?;
            completions.push(Completion {
                completed_at: parse_stored_timestamp(&created, "certificate")?,
                user_identity,
            });
        }
        Ok(completions)
    }
}

impl SiteResolver for SqliteSource {
    fn sites(&self) -> SourceResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT site FROM sites ORDER BY site")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn site_courses(&self, site: &str) -> SourceResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT course_id FROM site_courses WHERE site = ?1 ORDER BY course_id",
        )?;
        let rows = stmt.query_map(params![site], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn all_courses(&self) -> SourceResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT course_id FROM course_enrollments
             UNION SELECT course_id FROM site_courses
             ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COURSE: &str = "course-v1:org+c1+2018";

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn course() -> CourseKey {
        CourseKey::parse(COURSE).unwrap()
    }

    #[test]
    fn test_enrollments_respect_cutoff_and_active_flag() {
        let src = SqliteSource::open_memory().unwrap();
        src.add_enrollment("alice", COURSE, ts(2018, 5, 31, 23), true).unwrap();
        src.add_enrollment("bob", COURSE, ts(2018, 6, 1, 0), true).unwrap();
        src.add_enrollment("carol", COURSE, ts(2018, 5, 1, 9), false).unwrap();
        src.add_enrollment("dave", "course-v1:org+other+2018", ts(2018, 5, 1, 9), true)
            .unwrap();

        let found = src.enrollments_for(&course(), ts(2018, 6, 1, 0)).unwrap();
        let users: Vec<&str> = found.iter().map(|e| e.user_identity.as_str()).collect();
        assert_eq!(users, vec!["alice"]);
        assert_eq!(found[0].created, ts(2018, 5, 31, 23));
        assert!(found[0].is_active);

        let history = src.enrollment_history(&course(), ts(2018, 6, 1, 0)).unwrap();
        let users: Vec<(&str, bool)> = history
            .iter()
            .map(|e| (e.user_identity.as_str(), e.is_active))
            .collect();
        assert_eq!(users, vec![("carol", false), ("alice", true)]);
    }

    #[test]
    fn test_legacy_course_rows_are_found_under_their_own_key() {
        let src = SqliteSource::open_memory().unwrap();
        let legacy = "edX/DemoX/Demo_Course";
        src.add_enrollment("alice", legacy, ts(2018, 5, 1, 9), true).unwrap();
        src.add_enrollment("bob", "course-v1:edX+DemoX+Demo_Course", ts(2018, 5, 1, 9), true)
            .unwrap();

        let key = CourseKey::parse(legacy).unwrap();
        let found = src.enrollments_for(&key, ts(2018, 6, 1, 0)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_identity, "alice");
        assert_eq!(found[0].course_id.to_string(), legacy);
    }

    #[test]
    fn test_progress_uses_latest_snapshot_on_or_before() {
        let src = SqliteSource::open_memory().unwrap();
        let day = |d| NaiveDate::from_ymd_opt(2018, 6, d).unwrap();
        src.set_progress("alice", COURSE, day(1), 0.25).unwrap();
        src.set_progress("alice", COURSE, day(3), 0.5).unwrap();
        src.set_progress("alice", COURSE, day(5), 0.75).unwrap();

        assert_eq!(src.progress_fraction("alice", &course(), day(4)).unwrap(), 0.5);
        assert_eq!(src.progress_fraction("alice", &course(), day(5)).unwrap(), 0.75);
        // Nothing recorded yet
        assert_eq!(src.progress_fraction("bob", &course(), day(4)).unwrap(), 0.0);
    }

    #[test]
    fn test_progress_out_of_range_is_invalid_data() {
        let src = SqliteSource::open_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2018, 6, 1).unwrap();
        src.set_progress("alice", COURSE, day, 1.5).unwrap();
        let err = src.progress_fraction("alice", &course(), day).unwrap_err();
        assert!(matches!(err, SourceError::InvalidData(_)));
    }

    #[test]
    fn test_last_activity_is_most_recent() {
        let src = SqliteSource::open_memory().unwrap();
        src.add_activity("alice", COURSE, Some("m1"), ts(2018, 5, 31, 8)).unwrap();
        src.add_activity("alice", COURSE, Some("m2"), ts(2018, 6, 1, 8)).unwrap();

        assert_eq!(
            src.last_activity("alice", &course()).unwrap(),
            Some(ts(2018, 6, 1, 8))
        );
        assert_eq!(src.last_activity("bob", &course()).unwrap(), None);
    }

    #[test]
    fn test_completions_include_whole_day() {
        let src = SqliteSource::open_memory().unwrap();
        src.add_certificate("alice", COURSE, ts(2018, 6, 1, 23)).unwrap();
        src.add_certificate("bob", COURSE, ts(2018, 6, 2, 0)).unwrap();

        let found = src
            .completions_for(&course(), NaiveDate::from_ymd_opt(2018, 6, 1).unwrap())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_identity, "alice");
    }

    #[test]
    fn test_rfc3339_timestamps_are_accepted() {
        let src = SqliteSource::open_memory().unwrap();
        src.with_connection(|conn| {
            conn.execute(
                "INSERT INTO course_enrollments (user_identity, course_id, created)
                 VALUES ('alice', ?1, '2018-05-30T12:00:00Z')",
                params![COURSE],
            )
        })
        .unwrap();
        let found = src.enrollments_for(&course(), ts(2018, 6, 1, 0)).unwrap();
        assert_eq!(found[0].created, ts(2018, 5, 30, 12));
    }

    #[test]
    fn test_site_resolution() {
        let src = SqliteSource::open_memory().unwrap();
        src.add_site("beta", &["course-v1:b+1+1"]).unwrap();
        src.add_site("alpha", &["course-v1:a+2+2", "course-v1:a+1+1"]).unwrap();
        src.add_enrollment("x", "course-v1:c+1+1", ts(2018, 1, 1, 0), true).unwrap();

        assert_eq!(src.sites().unwrap(), vec!["alpha", "beta"]);
        assert_eq!(
            src.site_courses("alpha").unwrap(),
            vec!["course-v1:a+1+1", "course-v1:a+2+2"]
        );
        assert!(src.site_courses("missing").unwrap().is_empty());
        assert_eq!(src.all_courses().unwrap().len(), 4);
    }

    #[test]
    fn test_open_on_disk_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lms.db");
        {
            let conn = Connection::open(&path).unwrap();
            create_schema(&conn).unwrap();
            conn.execute(
                "INSERT INTO course_access_roles (user_identity, course_id, role)
                 VALUES ('teach', ?1, 'instructor')",
                params![COURSE],
            )
            .unwrap();
        }
        let src = SqliteSource::open(&path).unwrap();
        let roles = src.roles_for(&course()).unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].role, CourseRole::Instructor);
    }
}
