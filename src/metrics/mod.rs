//! Per-course daily aggregates.
//!
//! Every aggregator is a plain synchronous function over a [`LearnerSource`].
//! Batch-level source failures (listing enrollments, roles or completions)
//! propagate as errors. Failures tied to a single learner are captured as
//! [`NewPipelineError`]s and the aggregation carries on with a safe default.

pub mod types;

pub use types::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::course_key::{CourseKey, IntoCourseKey};
use crate::date_util::{days_between, next_day, start_of_day};
use crate::error::Result;
use crate::source::{Enrollment, LearnerSource, SourceError};

// ── Enrollment Selector ────────────────────────────────────────────

/// Identities holding an admin role on the course. CCX roles live on the
/// master course.
fn admin_identities(source: &dyn LearnerSource, course: &CourseKey) -> Result<HashSet<String>> {
    let roles = source.roles_for(&course.to_course_locator())?;
    Ok(roles
        .into_iter()
        .filter(|r| r.role.is_admin())
        .map(|r| r.user_identity)
        .collect())
}

/// Learner enrollments that existed by the end of `date_for`. Staff,
/// instructors and CCX coaches are excluded.
pub fn select_enrollments<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
) -> Result<Vec<Enrollment>> {
    let course = course.into_course_key()?;
    let cutoff = start_of_day(next_day(date_for));
    let admins = admin_identities(source, &course)?;
    let enrollments = source.enrollments_for(&course, cutoff)?;
    Ok(enrollments
        .into_iter()
        .filter(|e| !admins.contains(&e.user_identity))
        .collect())
}

// ── Progress Aggregator ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    /// Mean over all enrollments; failed learners count as 0.0.
    pub average: f64,
    pub errors: Vec<NewPipelineError>,
}

fn checked_progress(
    source: &dyn LearnerSource,
    user_identity: &str,
    course: &CourseKey,
    date_for: NaiveDate,
) -> std::result::Result<f64, SourceError> {
    let progress = source.progress_fraction(user_identity, course, date_for)?;
    if !progress.is_finite() || !(0.0..=1.0).contains(&progress) {
        return Err(SourceError::InvalidData(format!(
            "progress {progress} is outside [0, 1]"
        )));
    }
    Ok(progress)
}

pub fn average_progress<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
    enrollments: &[Enrollment],
) -> Result<ProgressSummary> {
    let course = course.into_course_key()?;
    let course_id = course.to_string();

    let (total, errors) = enrollments.iter().fold(
        (0.0_f64, Vec::new()),
        |(total, mut errors), enrollment| {
            match checked_progress(source, &enrollment.user_identity, &course, date_for) {
                Ok(progress) => (total + progress, errors),
                Err(e) => {
                    log::warn!(
                        "progress unavailable for {} in {course_id} on {date_for}: {e}",
                        enrollment.user_identity
                    );
                    errors.push(NewPipelineError::new(
                        PipelineErrorKind::GradesData,
                        &enrollment.user_identity,
                        &course_id,
                        date_for,
                        "Unable to get course progress",
                        Some(e.to_string()),
                    ));
                    (total, errors)
                }
            }
        },
    );

    let average = if enrollments.is_empty() {
        0.0
    } else {
        total / enrollments.len() as f64
    };
    Ok(ProgressSummary { average, errors })
}

// ── Completion Aggregator ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionSummary {
    /// Days from enrollment to completion, one entry per learner, ordered by
    /// learner identity.
    pub days: Vec<f64>,
    pub errors: Vec<NewPipelineError>,
}

pub fn days_to_complete<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
) -> Result<CompletionSummary> {
    let course = course.into_course_key()?;
    let course_id = course.to_string();
    let admins = admin_identities(source, &course)?;

    // Earliest completion per learner
    let mut completed: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for c in source.completions_for(&course, date_for)? {
        if admins.contains(&c.user_identity) {
            continue;
        }
        completed
            .entry(c.user_identity)
            .and_modify(|at| *at = (*at).min(c.completed_at))
            .or_insert(c.completed_at);
    }
    if completed.is_empty() {
        return Ok(CompletionSummary::default());
    }

    // Completers may have unenrolled since, so look past the active flag
    let mut enrolled: HashMap<String, Vec<Enrollment>> = HashMap::new();
    for e in source.enrollment_history(&course, start_of_day(next_day(date_for)))? {
        enrolled.entry(e.user_identity.clone()).or_default().push(e);
    }

    let mut summary = CompletionSummary::default();
    let record = |user: &str, msg: &str| {
        log::warn!("{msg} for {user} in {course_id} on {date_for}");
        NewPipelineError::new(
            PipelineErrorKind::CompletionData,
            user,
            &course_id,
            date_for,
            msg,
            None,
        )
    };

    for (user, completed_at) in &completed {
        let Some(records) = enrolled.get(user.as_str()) else {
            summary.errors.push(record(user, "Missing enrollment record"));
            continue;
        };
        if records.len() > 1 {
            summary.errors.push(record(user, "Multiple enrollment records"));
        }
        // No longer a learner of the course, not a data problem
        let Some(earliest) = records.iter().filter(|e| e.is_active).map(|e| e.created).min()
        else {
            log::debug!("{user} completed {course_id} but is no longer enrolled");
            continue;
        };
        let days = days_between(earliest, *completed_at);
        if days < 0.0 {
            summary.errors.push(record(user, "Completion precedes enrollment"));
            continue;
        }
        summary.days.push(days);
    }

    Ok(summary)
}

/// Mean of the given durations, `None` when there are none.
pub fn calc_average_days_to_complete(days: &[f64]) -> Option<f64> {
    if days.is_empty() {
        None
    } else {
        Some(days.iter().sum::<f64>() / days.len() as f64)
    }
}

pub fn average_days_to_complete<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
) -> Result<Option<f64>> {
    let summary = days_to_complete(source, course, date_for)?;
    Ok(calc_average_days_to_complete(&summary.days))
}

pub fn num_learners_completed<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
) -> Result<u64> {
    let summary = days_to_complete(source, course, date_for)?;
    Ok(summary.days.len() as u64)
}

// ── Activity Aggregator ────────────────────────────────────────────

/// Enrollments whose most recent activity falls on `date_for` (UTC).
pub fn count_active(
    source: &dyn LearnerSource,
    course: &CourseKey,
    date_for: NaiveDate,
    enrollments: &[Enrollment],
) -> Result<u64> {
    let mut count = 0;
    for e in enrollments {
        if let Some(ts) = source.last_activity(&e.user_identity, course)? {
            if ts.date_naive() == date_for {
                count += 1;
            }
        }
    }
    Ok(count)
}

pub fn active_learner_count<K: IntoCourseKey>(
    source: &dyn LearnerSource,
    course: K,
    date_for: NaiveDate,
) -> Result<u64> {
    let course = course.into_course_key()?;
    let enrollments = select_enrollments(source, &course, date_for)?;
    count_active(source, &course, date_for, &enrollments)
}

// ── Extractor ──────────────────────────────────────────────────────

/// Computes the metric values for one course and day.
pub trait Extract: Send + Sync {
    fn extract(&self, course: &CourseKey, date_for: NaiveDate) -> Result<Extraction>;
}

pub struct CourseDailyMetricsExtractor {
    source: Arc<dyn LearnerSource>,
}

impl CourseDailyMetricsExtractor {
    pub fn new(source: Arc<dyn LearnerSource>) -> Self {
        Self { source }
    }
}

impl Extract for CourseDailyMetricsExtractor {
    fn extract(&self, course: &CourseKey, date_for: NaiveDate) -> Result<Extraction> {
        let source = self.source.as_ref();

        let enrollments = select_enrollments(source, course, date_for)?;
        let progress = average_progress(source, course, date_for, &enrollments)?;
        let active = count_active(source, course, date_for, &enrollments)?;
        let completion = days_to_complete(source, course, date_for)?;

        log::debug!(
            "{course} {date_for}: {} enrollments, {} active, {} completed",
            enrollments.len(),
            active,
            completion.days.len()
        );

        let mut errors = progress.errors;
        errors.extend(completion.errors);

        Ok(Extraction {
            course_id: course.to_string(),
            date_for,
            values: MetricValues {
                enrollment_count: enrollments.len() as u64,
                active_learners_today: active,
                average_progress: Some(progress.average),
                average_days_to_complete: calc_average_days_to_complete(&completion.days),
                num_learners_completed: completion.days.len() as u64,
            },
            errors,
        })
    }
}
