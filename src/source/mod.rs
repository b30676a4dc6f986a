//! Interfaces to the learning platform the metrics are derived from.
//!
//! The pipeline never owns learner data: it reads enrollments, roles,
//! progress, activity and completions through [`LearnerSource`], and the list
//! of tenants and their courses through [`SiteResolver`]. All calls are
//! synchronous; the loader runs extraction on a blocking worker.

pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::course_key::CourseKey;

pub use sqlite::SqliteSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for SourceError {
    fn from(e: rusqlite::Error) -> Self {
        SourceError::Query(e.to_string())
    }
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// An enrollment of a learner in a course.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrollment {
    pub user_identity: String,
    pub course_id: CourseKey,
    pub created: DateTime<Utc>,
    pub is_active: bool,
}

/// Course-scoped roles. Staff, instructors and CCX coaches are not counted
/// as learners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum CourseRole {
    Staff,
    Instructor,
    CcxCoach,
    Other(String),
}

impl CourseRole {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "staff" => CourseRole::Staff,
            "instructor" => CourseRole::Instructor,
            "ccx_coach" => CourseRole::CcxCoach,
            other => CourseRole::Other(other.to_string()),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            CourseRole::Staff | CourseRole::Instructor | CourseRole::CcxCoach
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseAccessRole {
    pub user_identity: String,
    pub role: CourseRole,
}

/// A certificate or other completion record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub user_identity: String,
    pub completed_at: DateTime<Utc>,
}

/// Per-course learner data consumed by the aggregators.
pub trait LearnerSource: Send + Sync {
    /// Active enrollments in the course created strictly before `created_before`.
    fn enrollments_for(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>>;

    /// Every enrollment in the course created strictly before `created_before`,
    /// including ones the learner has since left.
    fn enrollment_history(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>>;

    fn roles_for(&self, course_id: &CourseKey) -> SourceResult<Vec<CourseAccessRole>>;

    /// Progress fraction in [0, 1] for one learner as of the given day.
    /// May fail for an individual learner.
    fn progress_fraction(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
        as_of: NaiveDate,
    ) -> SourceResult<f64>;

    fn last_activity(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
    ) -> SourceResult<Option<DateTime<Utc>>>;

    /// Completions dated on or before the end of `completed_on_or_before`.
    fn completions_for(
        &self,
        course_id: &CourseKey,
        completed_on_or_before: NaiveDate,
    ) -> SourceResult<Vec<Completion>>;
}

/// Multi-tenant site lookup.
pub trait SiteResolver: Send + Sync {
    fn sites(&self) -> SourceResult<Vec<String>>;

    fn site_courses(&self, site: &str) -> SourceResult<Vec<String>>;

    /// Every known course, used when running in single-site mode.
    fn all_courses(&self) -> SourceResult<Vec<String>>;
}
