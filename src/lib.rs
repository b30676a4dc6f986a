pub mod config;
pub mod course_key;
pub mod date_util;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod source;
pub mod storage;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use chrono::NaiveDate;

pub use config::PipelineConfig;
pub use course_key::{CourseKey, IntoCourseKey};
pub use date_util::DateRange;
pub use error::{Error, Result};
pub use metrics::{
    CourseDailyMetrics, CourseDailyMetricsExtractor, Extract, Extraction, MetricValues,
    PipelineErrorRecord,
};
pub use pipeline::{
    CourseRunReport, DailyRunReport, NoopProgress, Pipeline, RepairReport, RunProgress,
    RunStatus,
};
pub use source::{LearnerSource, SiteResolver, SourceError, SqliteSource};
pub use storage::repository::{
    MetricsFilter, PipelineErrorFilter, PipelineRun, WarehouseStatus,
};
pub use storage::Database;

use storage::repository;

/// Main entry point for the course metrics warehouse.
pub struct CourseDW {
    db: Database,
    pipeline: Pipeline,
}

impl CourseDW {
    pub fn new(
        db: Database,
        source: Arc<dyn LearnerSource>,
        resolver: Arc<dyn SiteResolver>,
        config: PipelineConfig,
    ) -> Self {
        let extractor = Arc::new(CourseDailyMetricsExtractor::new(source));
        Self::with_extractor(db, extractor, resolver, config)
    }

    /// Build around a custom extractor.
    pub fn with_extractor(
        db: Database,
        extractor: Arc<dyn Extract>,
        resolver: Arc<dyn SiteResolver>,
        config: PipelineConfig,
    ) -> Self {
        let pipeline = Pipeline::new(db.clone(), extractor, resolver, config);
        Self { db, pipeline }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    fn site_or_default<'a>(&'a self, site: Option<&'a str>) -> &'a str {
        site.unwrap_or(&self.pipeline.config().default_site)
    }

    // ── Pipeline commands ──────────────────────────────────────────

    /// Compute metrics for one site. Defaults to the configured site and to
    /// yesterday (UTC).
    pub async fn run_daily(
        &self,
        site: Option<&str>,
        date_for: Option<NaiveDate>,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<DailyRunReport> {
        let date_for = date_for.unwrap_or_else(date_util::default_date_for);
        self.pipeline
            .run_daily(self.site_or_default(site), date_for, force_update, progress)
            .await
    }

    pub async fn run_all(
        &self,
        date_for: Option<NaiveDate>,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<Vec<DailyRunReport>> {
        let date_for = date_for.unwrap_or_else(date_util::default_date_for);
        self.pipeline.run_all(date_for, force_update, progress).await
    }

    pub async fn backfill(
        &self,
        site: Option<&str>,
        range: &DateRange,
        force_update: bool,
        progress: &dyn RunProgress,
    ) -> Result<Vec<DailyRunReport>> {
        self.pipeline
            .backfill(self.site_or_default(site), range, force_update, progress)
            .await
    }

    pub async fn repair_backfill(&self, site: Option<&str>, dry_run: bool) -> Result<RepairReport> {
        pipeline::repair_backfill(&self.db, self.site_or_default(site), dry_run).await
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub async fn list_metrics(&self, filter: MetricsFilter) -> Result<Vec<CourseDailyMetrics>> {
        let records = self
            .db
            .reader()
            .call(move |conn| repository::list_daily_metrics(conn, &filter))
            .await?;
        Ok(records)
    }

    pub async fn list_pipeline_errors(
        &self,
        filter: PipelineErrorFilter,
    ) -> Result<Vec<PipelineErrorRecord>> {
        let errors = self
            .db
            .reader()
            .call(move |conn| repository::list_pipeline_errors(conn, &filter))
            .await?;
        Ok(errors)
    }

    /// Delete pipeline error records created before `before`. Returns the
    /// number removed.
    pub async fn prune_pipeline_errors(&self, before: NaiveDate) -> Result<usize> {
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::prune_pipeline_errors(conn, before))
            .await?;
        log::info!("pruned {removed} pipeline errors created before {before}");
        Ok(removed)
    }

    pub async fn status(&self) -> Result<WarehouseStatus> {
        let status = self
            .db
            .reader()
            .call(|conn| repository::warehouse_status(conn))
            .await?;
        Ok(status)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        config_get(&self.db, key).await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config_set(&self.db, key, value).await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        config_list(&self.db).await
    }
}

// Config access does not need a learner source, so the CLI can use these
// before one is opened.

pub async fn config_get(db: &Database, key: &str) -> Result<Option<String>> {
    db.reader()
        .call({
            let key = key.to_string();
            move |conn| repository::get_config(conn, &key)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Store a configuration value. Values for recognised keys are checked first.
pub async fn config_set(db: &Database, key: &str, value: &str) -> Result<()> {
    PipelineConfig::check_value(key, value)?;
    db.writer()
        .call({
            let key = key.to_string();
            let value = value.to_string();
            move |conn| repository::set_config(conn, &key, &value)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

pub async fn config_list(db: &Database) -> Result<Vec<(String, String)>> {
    db.reader()
        .call(|conn| repository::list_config(conn))
        .await
        .map_err(|e| Error::Database(e.to_string()))
}
