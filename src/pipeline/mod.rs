pub mod loader;
pub mod repair;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::course_key::CourseKey;
use crate::date_util::{format_date, DateRange};
use crate::error::{Error, Result};
use crate::metrics::{CourseDailyMetrics, Extract};
use crate::source::SiteResolver;
use crate::storage::repository;
use crate::storage::Database;

pub use loader::MetricsLoader;
pub use repair::{repair_backfill, RepairReport};

/// Callbacks for reporting run progress.
pub trait RunProgress: Send + Sync {
    fn on_run_start(&self, _site: &str, _date_for: NaiveDate, _courses: usize) {}
    fn on_course_complete(&self, _report: &CourseRunReport, _index: usize, _total: usize) {}
    fn on_run_complete(&self, _report: &DailyRunReport) {}
}

/// No-op progress reporter.
pub struct NoopProgress;

impl RunProgress for NoopProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "Success",
            RunStatus::PartialFailure => "PartialFailure",
            RunStatus::Failed => "Failed",
        }
    }
}

/// Outcome of one unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct CourseRunReport {
    pub course_id: String,
    pub status: RunStatus,
    pub record: Option<CourseDailyMetrics>,
    pub created: bool,
    pub error: Option<String>,
    pub invalid_fields: Vec<&'static str>,
}

impl CourseRunReport {
    fn from_result(course_id: &str, result: Result<(CourseDailyMetrics, bool)>) -> Self {
        match result {
            Ok((record, created)) => Self {
                course_id: course_id.to_string(),
                status: RunStatus::Success,
                record: Some(record),
                created,
                error: None,
                invalid_fields: Vec::new(),
            },
            Err(e) => Self {
                course_id: course_id.to_string(),
                status: RunStatus::Failed,
                record: None,
                created: false,
                invalid_fields: e.invalid_fields(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Report returned after a site's daily run completes.
#[derive(Debug, Clone, Serialize)]
pub struct DailyRunReport {
    pub site: String,
    pub date_for: NaiveDate,
    pub status: RunStatus,
    pub courses_succeeded: u64,
    pub courses_failed: u64,
    pub courses: Vec<CourseRunReport>,
    pub error: Option<String>,
}

impl DailyRunReport {
    /// Derive the run status from the per-course outcomes.
    pub fn from_courses(site: &str, date_for: NaiveDate, courses: Vec<CourseRunReport>) -> Self {
        let courses_failed = courses
            .iter()
            .filter(|c| c.status == RunStatus::Failed)
            .count() as u64;
        let courses_succeeded = courses.len() as u64 - courses_failed;
        let status = if courses_failed == 0 {
            RunStatus::Success
        } else if courses_succeeded > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failed
        };
        let error = if courses_failed > 0 {
            Some(format!("{courses_failed} courses failed"))
        } else {
            None
        };
        Self {
            site: site.to_string(),
            date_for,
            status,
            courses_succeeded,
            courses_failed,
            courses,
            error,
        }
    }

    /// A run that could not start, e.g. because its courses could not be listed.
    pub fn aborted(site: &str, date_for: NaiveDate, error: &Error) -> Self {
        Self {
            site: site.to_string(),
            date_for,
            status: RunStatus::Failed,
            courses_succeeded: 0,
            courses_failed: 0,
            courses: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn records_created(&self) -> usize {
        self.courses.iter().filter(|c| c.created).count()
    }
}

/// Runs the extract/load cycle over the courses of a site.
pub struct Pipeline {
    db: Database,
    extractor: Arc<dyn Extract>,
    resolver: Arc<dyn SiteResolver>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        db: Database,
        extractor: Arc<dyn Extract>,
        resolver: Arc<dyn SiteResolver>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            extractor,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Sites to process: every known site in multisite mode, otherwise the
    /// default site alone.
    pub fn sites(&self) -> Result<Vec<String>> {
        if self.config.multisite {
            Ok(self.resolver.sites()?)
        } else {
            Ok(vec![self.config.default_site.clone()])
        }
    }

    /// Courses belonging to a site.
    pub fn courses_for(&self, site: &str) -> Result<Vec<String>> {
        if self.config.multisite {
            return Ok(self.resolver.site_courses(site)?);
        }
        if site != self.config.default_site {
            return Err(Error::Config(format!(
                "unknown site '{site}' in single-site mode (default site is '{}')",
                self.config.default_site
            )));
        }
        Ok(self.resolver.all_courses()?)
    }

    /// Compute and store metrics for every course of `site` on `date_for`.
    ///
    /// Course failures are reported in the returned report. Only a failure to
    /// list the site's courses or to record the run aborts it.
    pub async fn run_daily(
        &self,
        site: &str,
        date_for: NaiveDate,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<DailyRunReport> {
        let run_id = self
            .db
            .writer()
            .call({
                let site = site.to_string();
                move |conn| repository::insert_pipeline_run(conn, &site, date_for, force_update)
            })
            .await?;

        let course_ids = match self.courses_for(site) {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("{site} {date_for}: cannot list courses: {e}");
                self.finish_run(run_id, &DailyRunReport::aborted(site, date_for, &e))
                    .await?;
                return Err(e);
            }
        };

        log::info!(
            "{site} {date_for}: computing metrics for {} courses{}",
            course_ids.len(),
            if force_update { " (forced)" } else { "" }
        );
        progress.on_run_start(site, date_for, course_ids.len());

        let total = course_ids.len();
        let mut courses = Vec::with_capacity(total);
        for (i, course_id) in course_ids.iter().enumerate() {
            let result = match CourseKey::parse(course_id) {
                Ok(key) => {
                    MetricsLoader::new(self.db.clone(), Arc::clone(&self.extractor), site, key)
                        .load(date_for, force_update)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                log::error!("{site} {course_id} {date_for}: {e}");
            }
            let report = CourseRunReport::from_result(course_id, result);
            progress.on_course_complete(&report, i, total);
            courses.push(report);
        }

        let report = DailyRunReport::from_courses(site, date_for, courses);
        self.finish_run(run_id, &report).await?;
        log::info!(
            "{site} {date_for}: {} ({} ok, {} failed)",
            report.status.as_str(),
            report.courses_succeeded,
            report.courses_failed
        );
        progress.on_run_complete(&report);
        Ok(report)
    }

    async fn finish_run(&self, run_id: i64, report: &DailyRunReport) -> Result<()> {
        let status = report.status.as_str();
        let (ok, failed) = (report.courses_succeeded, report.courses_failed);
        let error = report.error.clone();
        self.db
            .writer()
            .call(move |conn| {
                repository::finish_pipeline_run(
                    conn,
                    run_id,
                    status,
                    ok + failed,
                    ok,
                    failed,
                    error.as_deref(),
                )
            })
            .await?;
        Ok(())
    }

    /// Run `run_daily` for every site. A site whose run cannot start is
    /// reported as failed; the remaining sites still run.
    pub async fn run_all(
        &self,
        date_for: NaiveDate,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<Vec<DailyRunReport>> {
        let mut reports = Vec::new();
        for site in self.sites()? {
            match self.run_daily(&site, date_for, force_update, progress).await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(DailyRunReport::aborted(&site, date_for, &e)),
            }
        }
        Ok(reports)
    }

    /// Run `run_daily` for each day of the inclusive range, oldest first.
    /// A day whose run cannot start is reported as failed.
    ///
    /// Records written this way describe past days from present-day learner
    /// state and will be picked up by [`repair_backfill`].
    pub async fn backfill(
        &self,
        site: &str,
        range: &DateRange,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<Vec<DailyRunReport>> {
        let days = range.days();
        if days.is_empty() {
            log::warn!(
                "empty backfill range {} to {}",
                format_date(range.start),
                format_date(range.end)
            );
        }
        let mut reports = Vec::with_capacity(days.len());
        for date_for in days {
            match self.run_daily(site, date_for, force_update, progress).await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(DailyRunReport::aborted(site, date_for, &e)),
            }
        }
        Ok(reports)
    }
}
