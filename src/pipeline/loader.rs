use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::course_key::CourseKey;
use crate::error::{Error, Result};
use crate::metrics::{CourseDailyMetrics, Extract};
use crate::storage::repository;
use crate::storage::Database;

/// Get-or-create persistence of one course's daily metrics on one site.
pub struct MetricsLoader {
    db: Database,
    extractor: Arc<dyn Extract>,
    site: String,
    course: CourseKey,
}

impl MetricsLoader {
    pub fn new(db: Database, extractor: Arc<dyn Extract>, site: &str, course: CourseKey) -> Self {
        Self {
            db,
            extractor,
            site: site.to_string(),
            course,
        }
    }

    /// Return the stored record for `date_for`, computing it first when it is
    /// missing or `force_update` is set. The flag is true when a new record
    /// was inserted.
    ///
    /// Per-learner errors from extraction are committed even when the values
    /// fail validation, in which case no metric record is written and
    /// [`Error::Validation`] is returned.
    pub async fn load(
        &self,
        date_for: NaiveDate,
        force_update: bool,
    ) -> Result<(CourseDailyMetrics, bool)> {
        let course_id = self.course.to_string();

        let existing = self
            .db
            .reader()
            .call({
                let site = self.site.clone();
                let course_id = course_id.clone();
                move |conn| repository::get_daily_metrics(conn, &site, &course_id, date_for)
            })
            .await?;

        if let Some(record) = existing {
            if !force_update {
                log::debug!("{course_id} {date_for}: already computed, skipping");
                return Ok((record, false));
            }
        }

        let extraction = {
            let extractor = Arc::clone(&self.extractor);
            let course = self.course.clone();
            tokio::task::spawn_blocking(move || extractor.extract(&course, date_for))
                .await
                .map_err(|e| Error::Other(format!("extraction task failed: {e}")))??
        };

        let validation = extraction.values.validate();
        let valid = validation.is_ok();
        let error_count = extraction.errors.len();

        let stored = self
            .db
            .writer()
            .call({
                let site = self.site.clone();
                move |conn| {
                    let now = Utc::now();
                    let tx = conn.transaction()?;
                    for error in &extraction.errors {
                        repository::insert_pipeline_error(&tx, &site, error, now)?;
                    }
                    let stored = if valid {
                        Some(repository::upsert_daily_metrics(
                            &tx,
                            &site,
                            &extraction.course_id,
                            extraction.date_for,
                            &extraction.values,
                            now,
                        )?)
                    } else {
                        None
                    };
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(stored)
                }
            })
            .await?;

        if error_count > 0 {
            log::warn!("{course_id} {date_for}: {error_count} learner errors recorded");
        }

        validation.inspect_err(|e| log::warn!("{course_id} {date_for}: {e}"))?;

        let (record, created) = stored
            .ok_or_else(|| Error::Other(format!("{course_id} {date_for}: record not stored")))?;
        log::info!(
            "{course_id} {date_for}: {} ({} enrollments)",
            if created { "created" } else { "updated" },
            record.values.enrollment_count
        );
        Ok((record, created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        CourseDailyMetricsExtractor, Extraction, MetricValues, NewPipelineError,
        PipelineErrorKind,
    };
    use crate::source::LearnerSource;
    use crate::storage::repository::PipelineErrorFilter;
    use crate::test_support::{date_for, seeded_source, FlakySource, COURSE, SITE};

    /// Returns fixed values regardless of the learner data.
    struct StubExtractor {
        values: MetricValues,
        errors: usize,
    }

    impl Extract for StubExtractor {
        fn extract(&self, course: &CourseKey, date_for: NaiveDate) -> Result<Extraction> {
            let errors = (0..self.errors)
                .map(|i| {
                    NewPipelineError::new(
                        PipelineErrorKind::GradesData,
                        &format!("learner{i}"),
                        &course.to_string(),
                        date_for,
                        "Unable to get course progress",
                        None,
                    )
                })
                .collect();
            Ok(Extraction {
                course_id: course.to_string(),
                date_for,
                values: self.values.clone(),
                errors,
            })
        }
    }

    fn course() -> CourseKey {
        CourseKey::parse(COURSE).unwrap()
    }

    fn seeded_loader(db: &Database) -> MetricsLoader {
        let source: Arc<dyn LearnerSource> = Arc::new(seeded_source());
        let extractor: Arc<dyn Extract> = Arc::new(CourseDailyMetricsExtractor::new(source));
        MetricsLoader::new(db.clone(), extractor, SITE, course())
    }

    fn stub_loader(db: &Database, progress: f64, errors: usize) -> MetricsLoader {
        let extractor = StubExtractor {
            values: MetricValues {
                enrollment_count: 2,
                active_learners_today: 1,
                average_progress: Some(progress),
                average_days_to_complete: None,
                num_learners_completed: 0,
            },
            errors,
        };
        MetricsLoader::new(db.clone(), Arc::new(extractor), SITE, course())
    }

    async fn record_count(db: &Database) -> i64 {
        db.reader()
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM course_daily_metrics", [], |r| r.get(0))
            })
            .await
            .unwrap()
    }

    async fn error_count(db: &Database) -> u64 {
        db.reader()
            .call(|conn| repository::count_pipeline_errors(conn))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let loader = seeded_loader(&db);

        let (first, created) = loader.load(date_for(), false).await.unwrap();
        assert!(created);
        assert_eq!(first.site, SITE);
        assert_eq!(first.course_id, COURSE);
        assert_eq!(first.values.enrollment_count, 4);
        assert_eq!(first.values.average_days_to_complete, Some(20.0));

        let (second, created) = loader.load(date_for(), false).await.unwrap();
        assert!(!created);
        assert_eq!(second, first);
        assert_eq!(record_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_force_update_overwrites_in_place() {
        let db = Database::open_memory().await.unwrap();

        let (first, created) = stub_loader(&db, 0.25, 0).load(date_for(), false).await.unwrap();
        assert!(created);

        // Without force the stored record wins
        let (kept, _) = stub_loader(&db, 0.75, 0).load(date_for(), false).await.unwrap();
        assert_eq!(kept.values.average_progress, Some(0.25));

        let (updated, created) = stub_loader(&db, 0.75, 0).load(date_for(), true).await.unwrap();
        assert!(!created);
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.created, first.created);
        assert_eq!(updated.values.average_progress, Some(0.75));
        assert_eq!(record_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_progress_is_rejected() {
        for progress in [-0.01, 1.01] {
            let db = Database::open_memory().await.unwrap();
            let err = stub_loader(&db, progress, 0)
                .load(date_for(), false)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
            assert_eq!(err.invalid_fields(), vec!["average_progress"]);
            assert_eq!(record_count(&db).await, 0);
        }
    }

    #[tokio::test]
    async fn test_rejected_values_keep_learner_errors() {
        let db = Database::open_memory().await.unwrap();
        let err = stub_loader(&db, 1.01, 2).load(date_for(), false).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(record_count(&db).await, 0);
        assert_eq!(error_count(&db).await, 2);
    }

    #[tokio::test]
    async fn test_forced_invalid_values_leave_stored_record_alone() {
        let db = Database::open_memory().await.unwrap();
        let (stored, _) = stub_loader(&db, 0.25, 0).load(date_for(), false).await.unwrap();

        let err = stub_loader(&db, 1.01, 0)
            .load(date_for(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let (after, created) = stub_loader(&db, 0.5, 0).load(date_for(), false).await.unwrap();
        assert!(!created);
        assert_eq!(after, stored);
        assert_eq!(after.modified, stored.modified);
        assert_eq!(record_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_learner_failures_are_persisted_with_record() {
        let db = Database::open_memory().await.unwrap();
        let source: Arc<dyn LearnerSource> =
            Arc::new(FlakySource::new(seeded_source(), &["learner1", "learner3"]));
        let extractor: Arc<dyn Extract> = Arc::new(CourseDailyMetricsExtractor::new(source));
        let loader = MetricsLoader::new(db.clone(), extractor, SITE, course());

        let (record, created) = loader.load(date_for(), false).await.unwrap();
        assert!(created);
        assert_eq!(record.values.average_progress, Some(0.125));

        let errors = db
            .reader()
            .call(|conn| {
                repository::list_pipeline_errors(
                    conn,
                    &PipelineErrorFilter {
                        site: Some(SITE.into()),
                        limit: 10,
                        ..Default::default()
                    },
                )
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == "grades_data"));
        assert!(errors.iter().all(|e| e.date_for == Some(date_for())));
    }
}
