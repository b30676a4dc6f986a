use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::date_util::start_of_day;
use crate::error::{Error, FieldError, Result};

/// Records stored more than this many days after `date_for` were computed
/// from present-day learner state and are treated as backfill artifacts.
pub const BACKFILL_THRESHOLD_DAYS: i64 = 2;

/// The computed aggregates for one course on one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricValues {
    pub enrollment_count: u64,
    pub active_learners_today: u64,
    /// Mean progress fraction. `None` means not computed or invalidated.
    pub average_progress: Option<f64>,
    /// Mean days from enrollment to completion. `None` with zero completions.
    pub average_days_to_complete: Option<f64>,
    pub num_learners_completed: u64,
}

impl MetricValues {
    /// Check the values against the record invariants. Every offending field
    /// is reported, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut fields = Vec::new();

        if let Some(p) = self.average_progress {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                fields.push(FieldError {
                    field: "average_progress",
                    message: format!("must be between 0.0 and 1.0, got {p}"),
                });
            }
        }
        if let Some(days) = self.average_days_to_complete {
            if !days.is_finite() || days < 0.0 {
                fields.push(FieldError {
                    field: "average_days_to_complete",
                    message: format!("must be a non-negative number, got {days}"),
                });
            }
        }
        if self.active_learners_today > self.enrollment_count {
            fields.push(FieldError {
                field: "active_learners_today",
                message: format!(
                    "{} exceeds enrollment_count {}",
                    self.active_learners_today, self.enrollment_count
                ),
            });
        }
        if self.num_learners_completed > self.enrollment_count {
            fields.push(FieldError {
                field: "num_learners_completed",
                message: format!(
                    "{} exceeds enrollment_count {}",
                    self.num_learners_completed, self.enrollment_count
                ),
            });
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation { fields })
        }
    }
}

/// A persisted daily metrics record, unique per (site, course_id, date_for).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseDailyMetrics {
    pub id: i64,
    pub site: String,
    pub course_id: String,
    pub date_for: NaiveDate,
    #[serde(flatten)]
    pub values: MetricValues,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl CourseDailyMetrics {
    pub fn is_backfill_artifact(&self) -> bool {
        self.created > start_of_day(self.date_for) + Duration::days(BACKFILL_THRESHOLD_DAYS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// Progress could not be computed for a learner.
    GradesData,
    /// A completion could not be matched to a usable enrollment.
    CompletionData,
}

impl PipelineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineErrorKind::GradesData => "grades_data",
            PipelineErrorKind::CompletionData => "completion_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grades_data" => Some(PipelineErrorKind::GradesData),
            "completion_data" => Some(PipelineErrorKind::CompletionData),
            _ => None,
        }
    }
}

/// A per-learner failure captured during extraction, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPipelineError {
    pub kind: PipelineErrorKind,
    pub user_identity: Option<String>,
    pub course_id: String,
    pub date_for: NaiveDate,
    pub data: serde_json::Value,
}

impl NewPipelineError {
    pub fn new(
        kind: PipelineErrorKind,
        user_identity: &str,
        course_id: &str,
        date_for: NaiveDate,
        msg: &str,
        exception: Option<String>,
    ) -> Self {
        Self {
            kind,
            user_identity: Some(user_identity.to_string()),
            course_id: course_id.to_string(),
            date_for,
            data: serde_json::json!({
                "msg": msg,
                "username": user_identity,
                "course_id": course_id,
                "exception": exception,
            }),
        }
    }
}

/// A stored pipeline error record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineErrorRecord {
    pub id: i64,
    pub kind: String,
    pub site: String,
    pub user_identity: Option<String>,
    pub course_id: Option<String>,
    pub date_for: Option<NaiveDate>,
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
}

/// Everything one extraction produced: the aggregates and the per-learner
/// failures encountered on the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub course_id: String,
    pub date_for: NaiveDate,
    pub values: MetricValues,
    pub errors: Vec<NewPipelineError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> MetricValues {
        MetricValues {
            enrollment_count: 3,
            active_learners_today: 2,
            average_progress: Some(0.5),
            average_days_to_complete: Some(20.0),
            num_learners_completed: 3,
        }
    }

    #[test]
    fn test_validate_accepts_bounds_and_nulls() {
        assert!(valid().validate().is_ok());
        for p in [0.0, 1.0] {
            let v = MetricValues { average_progress: Some(p), ..valid() };
            assert!(v.validate().is_ok());
        }
        assert!(MetricValues::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_progress_out_of_range() {
        for p in [-1.0, -0.01, 1.01, f64::NAN] {
            let v = MetricValues { average_progress: Some(p), ..valid() };
            let err = v.validate().unwrap_err();
            assert_eq!(err.invalid_fields(), vec!["average_progress"]);
        }
    }

    #[test]
    fn test_validate_reports_every_bad_field() {
        let v = MetricValues {
            enrollment_count: 1,
            active_learners_today: 2,
            average_progress: Some(2.0),
            average_days_to_complete: Some(-1.0),
            num_learners_completed: 5,
        };
        let err = v.validate().unwrap_err();
        assert_eq!(
            err.invalid_fields(),
            vec![
                "average_progress",
                "average_days_to_complete",
                "active_learners_today",
                "num_learners_completed",
            ]
        );
    }

    #[test]
    fn test_backfill_artifact_threshold() {
        let date_for = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        let record = |created: DateTime<Utc>| CourseDailyMetrics {
            id: 1,
            site: "s".into(),
            course_id: "course-v1:a+b+c".into(),
            date_for,
            values: valid(),
            created,
            modified: created,
        };
        let midnight = start_of_day(date_for);
        assert!(!record(midnight + Duration::days(1)).is_backfill_artifact());
        assert!(!record(midnight + Duration::days(2)).is_backfill_artifact());
        assert!(record(midnight + Duration::days(2) + Duration::seconds(1)).is_backfill_artifact());
        assert!(record(midnight + Duration::days(3)).is_backfill_artifact());
    }

    #[test]
    fn test_pipeline_error_payload() {
        let date_for = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        let e = NewPipelineError::new(
            PipelineErrorKind::GradesData,
            "alice",
            "course-v1:a+b+c",
            date_for,
            "Unable to get course progress",
            Some("boom".into()),
        );
        assert_eq!(e.data["username"], "alice");
        assert_eq!(e.data["exception"], "boom");
        assert_eq!(PipelineErrorKind::parse(e.kind.as_str()), Some(e.kind));
    }
}
