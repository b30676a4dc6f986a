//! Shared fixtures for the unit tests.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::course_key::CourseKey;
use crate::date_util::start_of_day;
use crate::source::{
    Completion, CourseAccessRole, Enrollment, LearnerSource, SourceError, SourceResult,
    SqliteSource,
};

pub const COURSE: &str = "course-v1:StarFleetAcademy+SFA01+2161";
pub const SITE: &str = "starfleet";

pub fn date_for() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 6, 1).unwrap()
}

pub fn at(date: NaiveDate, hours: i64) -> DateTime<Utc> {
    start_of_day(date) + Duration::hours(hours)
}

/// One course on one site:
/// - four learners enrolled 60 days before `date_for`,
/// - three admins (staff, instructor, ccx coach) also enrolled,
/// - one learner enrolled the day after `date_for`,
/// - learners 1-3 completed after 10, 20 and 30 days, the staff member after 5,
/// - learners 1 and 3 were last active on `date_for`, learner 2 the day before,
/// - progress 0.25, 0.5, 0.75 for learners 1-3, nothing for learner 4.
pub fn seeded_source() -> SqliteSource {
    let src = SqliteSource::open_memory().unwrap();
    let day = date_for();
    let enrolled = start_of_day(day) - Duration::days(60);
    let yesterday = day - Duration::days(1);

    src.add_site(SITE, &[COURSE]).unwrap();

    for user in ["learner1", "learner2", "learner3", "learner4"] {
        src.add_enrollment(user, COURSE, enrolled, true).unwrap();
    }
    for (user, role) in [
        ("coach", "ccx_coach"),
        ("professor", "instructor"),
        ("staffer", "staff"),
    ] {
        src.add_enrollment(user, COURSE, enrolled, true).unwrap();
        src.add_role(user, COURSE, role).unwrap();
    }
    src.add_enrollment("latecomer", COURSE, at(day, 25), true).unwrap();

    src.add_certificate("learner1", COURSE, enrolled + Duration::days(10)).unwrap();
    src.add_certificate("learner2", COURSE, enrolled + Duration::days(20)).unwrap();
    src.add_certificate("learner3", COURSE, enrolled + Duration::days(30)).unwrap();
    src.add_certificate("staffer", COURSE, enrolled + Duration::days(5)).unwrap();

    src.add_activity("learner1", COURSE, Some("block-1"), at(day, 10)).unwrap();
    src.add_activity("learner2", COURSE, Some("block-1"), at(yesterday, 10)).unwrap();
    src.add_activity("learner3", COURSE, Some("block-1"), at(yesterday, 9)).unwrap();
    src.add_activity("learner3", COURSE, Some("block-2"), at(day, 23)).unwrap();

    src.set_progress("learner1", COURSE, day, 0.25).unwrap();
    src.set_progress("learner2", COURSE, day, 0.5).unwrap();
    src.set_progress("learner3", COURSE, day, 0.75).unwrap();

    src
}

/// Delegates to an inner source but fails progress lookups for chosen learners.
pub struct FlakySource {
    pub inner: SqliteSource,
    pub fail_for: HashSet<String>,
}

impl FlakySource {
    pub fn new(inner: SqliteSource, fail_for: &[&str]) -> Self {
        Self {
            inner,
            fail_for: fail_for.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl LearnerSource for FlakySource {
    fn enrollments_for(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>> {
        self.inner.enrollments_for(course_id, created_before)
    }

    fn enrollment_history(
        &self,
        course_id: &CourseKey,
        created_before: DateTime<Utc>,
    ) -> SourceResult<Vec<Enrollment>> {
        self.inner.enrollment_history(course_id, created_before)
    }

    fn roles_for(&self, course_id: &CourseKey) -> SourceResult<Vec<CourseAccessRole>> {
        self.inner.roles_for(course_id)
    }

    fn progress_fraction(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
        as_of: NaiveDate,
    ) -> SourceResult<f64> {
        if self.fail_for.contains(user_identity) {
            return Err(SourceError::Other("mock-failure".into()));
        }
        self.inner.progress_fraction(user_identity, course_id, as_of)
    }

    fn last_activity(
        &self,
        user_identity: &str,
        course_id: &CourseKey,
    ) -> SourceResult<Option<DateTime<Utc>>> {
        self.inner.last_activity(user_identity, course_id)
    }

    fn completions_for(
        &self,
        course_id: &CourseKey,
        completed_on_or_before: NaiveDate,
    ) -> SourceResult<Vec<Completion>> {
        self.inner.completions_for(course_id, completed_on_or_before)
    }
}
