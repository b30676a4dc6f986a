use chrono::NaiveDate;
use serde::Serialize;

use crate::error::Result;
use crate::storage::repository::{self, BackfillSummary};
use crate::storage::Database;

/// Outcome of a backfill repair pass over one site.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub site: String,
    /// Records identified as backfill artifacts.
    pub count: u64,
    /// Earliest and latest `date_for` among them.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub affected_courses: Vec<String>,
    pub dry_run: bool,
    /// Rows whose `average_progress` was cleared. Always 0 on a dry run.
    pub updated: u64,
}

impl RepairReport {
    fn from_summary(site: &str, summary: BackfillSummary, dry_run: bool, updated: u64) -> Self {
        let date_range = match (summary.earliest, summary.latest) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };
        Self {
            site: site.to_string(),
            count: summary.count,
            date_range,
            affected_courses: summary.courses,
            dry_run,
            updated,
        }
    }
}

/// Clear `average_progress` on every record of the site that was stored more
/// than two days after the day it describes. Such values were computed from
/// present-day learner state. A dry run only reports what would change.
pub async fn repair_backfill(db: &Database, site: &str, dry_run: bool) -> Result<RepairReport> {
    let report = if dry_run {
        let summary = db
            .reader()
            .call({
                let site = site.to_string();
                move |conn| repository::summarize_backfill_artifacts(conn, &site)
            })
            .await?;
        RepairReport::from_summary(site, summary, true, 0)
    } else {
        let (summary, updated) = db
            .writer()
            .call({
                let site = site.to_string();
                move |conn| {
                    let tx = conn.transaction()?;
                    let summary = repository::summarize_backfill_artifacts(&tx, &site)?;
                    let updated = if summary.count > 0 {
                        repository::clear_backfilled_progress(&tx, &site)?
                    } else {
                        0
                    };
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>((summary, updated as u64))
                }
            })
            .await?;
        RepairReport::from_summary(site, summary, false, updated)
    };

    if report.count == 0 {
        log::info!("{site}: no backfilled records found");
    } else if dry_run {
        log::info!(
            "{site}: {} backfilled records in {} courses would be repaired",
            report.count,
            report.affected_courses.len()
        );
    } else {
        log::info!("{site}: cleared average_progress on {} records", report.updated);
    }
    Ok(report)
}
