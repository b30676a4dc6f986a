use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use coursedw::date_util::parse_date;
use coursedw::{
    CourseDW, DailyRunReport, Database, DateRange, MetricsFilter, PipelineConfig,
    PipelineErrorFilter, RepairReport, SqliteSource,
};

#[derive(Parser)]
#[command(name = "coursedw", about = "Daily course metrics warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.coursedw/coursedw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl coursedw::RunProgress for StderrProgress {
    fn on_run_start(&self, site: &str, date_for: chrono::NaiveDate, courses: usize) {
        eprintln!("{site} {date_for}: {courses} courses");
    }

    fn on_course_complete(&self, report: &coursedw::CourseRunReport, index: usize, total: usize) {
        match &report.error {
            Some(e) => eprintln!("  [{}/{}] {} FAILED: {e}", index + 1, total, report.course_id),
            None => eprintln!("  [{}/{}] {}", index + 1, total, report.course_id),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute daily metrics (all sites in multisite mode unless --site is given)
    Run {
        /// Site to compute (default: configured default_site)
        #[arg(long)]
        site: Option<String>,
        /// Day to compute, YYYY-MM-DD (default: yesterday, UTC)
        #[arg(long)]
        date: Option<String>,
        /// Recompute days that already have a record
        #[arg(long)]
        force: bool,
        /// Learner snapshot database (default: configured source_db)
        #[arg(long)]
        source: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compute metrics for every day of a date range
    Backfill {
        #[arg(long)]
        site: Option<String>,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: String,
        /// Last day (inclusive), YYYY-MM-DD
        #[arg(long)]
        to: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        source: Option<String>,
    },
    /// Clear average_progress on records computed after the fact
    Repair {
        #[arg(long)]
        site: Option<String>,
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// List stored daily metrics
    Metrics {
        #[arg(long)]
        site: Option<String>,
        /// Filter by course id
        #[arg(long)]
        course: Option<String>,
        /// Earliest day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Latest day, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or prune per-learner pipeline errors
    Errors {
        #[command(subcommand)]
        action: ErrorsAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum ErrorsAction {
    /// List recent pipeline errors
    List {
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Delete pipeline errors created before a day
    Prune {
        /// YYYY-MM-DD
        #[arg(long)]
        before: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Config { action } => handle_config(&db, action).await?,
        Commands::Run {
            site,
            date,
            force,
            source,
            json,
        } => {
            let date_for = date.as_deref().map(parse_date).transpose()?;
            let dw = open_warehouse(db, source.as_deref()).await?;
            let reports = match site {
                None if dw.config().multisite => {
                    dw.run_all(date_for, force, &StderrProgress).await?
                }
                site => vec![
                    dw.run_daily(site.as_deref(), date_for, force, &StderrProgress)
                        .await?,
                ],
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                reports.iter().for_each(print_run_report);
            }
        }
        Commands::Backfill {
            site,
            from,
            to,
            force,
            source,
        } => {
            let range = DateRange::new(parse_date(&from)?, parse_date(&to)?);
            let dw = open_warehouse(db, source.as_deref()).await?;
            let reports = dw
                .backfill(site.as_deref(), &range, force, &StderrProgress)
                .await?;
            if reports.is_empty() {
                println!("Nothing to do: {from} is after {to}.");
            }
            reports.iter().for_each(print_run_report);
        }
        Commands::Repair {
            site,
            dry_run,
            json,
        } => {
            let config = PipelineConfig::load(&db).await?;
            let site = site.unwrap_or(config.default_site);
            let report = coursedw::pipeline::repair_backfill(&db, &site, dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_repair_report(&report);
            }
        }
        Commands::Metrics {
            site,
            course,
            from,
            to,
            limit,
            json,
        } => {
            let config = PipelineConfig::load(&db).await?;
            let filter = MetricsFilter {
                site: site.unwrap_or(config.default_site),
                course_id: course
                    .as_deref()
                    .map(coursedw::CourseKey::parse)
                    .transpose()?
                    .map(|k| k.to_string()),
                start: from.as_deref().map(parse_date).transpose()?,
                end: to.as_deref().map(parse_date).transpose()?,
                limit,
            };
            handle_metrics(&db, filter, json).await?;
        }
        Commands::Errors { action } => handle_errors(&db, action).await?,
        Commands::Status => print_status(&db).await?,
    }

    Ok(())
}

/// Build the warehouse around the learner snapshot named by `--source` or the
/// `source_db` config key.
async fn open_warehouse(db: Database, source: Option<&str>) -> anyhow::Result<CourseDW> {
    let config = PipelineConfig::load(&db).await?;
    let path = source
        .map(PathBuf::from)
        .or_else(|| config.source_db.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No learner source configured. Pass --source or run: coursedw config set source_db <PATH>"
            )
        })?;
    log::info!("reading learner data from {}", path.display());
    let src = Arc::new(SqliteSource::open(&path)?);
    Ok(CourseDW::new(db, src.clone(), src, config))
}

fn print_run_report(report: &DailyRunReport) {
    println!(
        "{} {}: {:?} ({} ok, {} failed, {} new records)",
        report.site,
        report.date_for,
        report.status,
        report.courses_succeeded,
        report.courses_failed,
        report.records_created()
    );
    if let Some(ref err) = report.error {
        println!("  {err}");
    }
    for course in report.courses.iter().filter(|c| c.error.is_some()) {
        println!(
            "  {}: {}",
            course.course_id,
            course.error.as_deref().unwrap_or_default()
        );
    }
}

fn print_repair_report(report: &RepairReport) {
    if report.count == 0 {
        println!("{}: no backfilled records found.", report.site);
        return;
    }
    let verb = if report.dry_run { "would be repaired" } else { "repaired" };
    println!("{}: {} records {verb}", report.site, report.count);
    if let Some((start, end)) = report.date_range {
        println!("  Dates:   {start} to {end}");
    }
    println!("  Courses: {}", report.affected_courses.len());
    for course in &report.affected_courses {
        println!("    {course}");
    }
}

async fn handle_metrics(db: &Database, filter: MetricsFilter, json: bool) -> anyhow::Result<()> {
    let records = db
        .reader()
        .call(move |conn| coursedw::storage::repository::list_daily_metrics(conn, &filter))
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No metrics found.");
        return Ok(());
    }
    println!(
        "{:<10}  {:<40}  {:>7}  {:>6}  {:>8}  {:>9}  {:>9}",
        "date", "course", "enrolled", "active", "progress", "completed", "avg days"
    );
    for r in &records {
        let v = &r.values;
        println!(
            "{:<10}  {:<40}  {:>7}  {:>6}  {:>8}  {:>9}  {:>9}",
            r.date_for,
            r.course_id,
            v.enrollment_count,
            v.active_learners_today,
            v.average_progress
                .map(|p| format!("{:.1}%", p * 100.0))
                .unwrap_or_else(|| "-".into()),
            v.num_learners_completed,
            v.average_days_to_complete
                .map(|d| format!("{d:.1}"))
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

async fn handle_errors(db: &Database, action: ErrorsAction) -> anyhow::Result<()> {
    match action {
        ErrorsAction::List {
            site,
            course,
            limit,
            json,
        } => {
            let filter = PipelineErrorFilter {
                site,
                course_id: course,
                date_for: None,
                limit,
            };
            let errors = db
                .reader()
                .call(move |conn| {
                    coursedw::storage::repository::list_pipeline_errors(conn, &filter)
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&errors)?);
            } else if errors.is_empty() {
                println!("No pipeline errors.");
            } else {
                for e in errors {
                    let date = e.date_for.map(|d| d.to_string()).unwrap_or_default();
                    let msg = e.data.get("msg").and_then(|m| m.as_str()).unwrap_or("");
                    println!(
                        "{} {} {} {} {}: {msg}",
                        e.created.format("%Y-%m-%d %H:%M"),
                        e.kind,
                        date,
                        e.course_id.as_deref().unwrap_or("-"),
                        e.user_identity.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        ErrorsAction::Prune { before } => {
            let before = parse_date(&before)?;
            let removed = db
                .writer()
                .call(move |conn| {
                    coursedw::storage::repository::prune_pipeline_errors(conn, before)
                })
                .await?;
            println!("Removed {removed} pipeline errors created before {before}.");
        }
    }
    Ok(())
}

async fn handle_config(db: &Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match coursedw::config_get(db, &key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            coursedw::config_set(db, &key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = coursedw::config_list(db).await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn print_status(db: &Database) -> anyhow::Result<()> {
    let status = db
        .reader()
        .call(|conn| coursedw::storage::repository::warehouse_status(conn))
        .await?;
    let config = PipelineConfig::load(db).await?;

    println!("coursedw status");
    println!(
        "  Mode:            {}",
        if config.multisite { "multisite" } else { "single site" }
    );
    println!("  Default site:    {}", config.default_site);
    println!(
        "  Learner source:  {}",
        config
            .source_db
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "not configured".to_string())
    );
    println!(
        "  Metric records:  {} ({} sites, {} courses)",
        status.metric_records, status.sites, status.courses
    );
    if let (Some(first), Some(last)) = (&status.earliest_date, &status.latest_date) {
        println!("  Date range:      {first} to {last}");
    }
    println!("  Pipeline errors: {}", status.pipeline_errors);
    println!("  Runs:            {}", status.pipeline_runs);
    match status.last_run {
        Some(run) => println!(
            "  Last run:        {} {} {} ({} ok, {} failed) at {}",
            run.site,
            run.date_for,
            run.status,
            run.courses_succeeded,
            run.courses_failed,
            run.completed_at.unwrap_or_default()
        ),
        None => println!("  Last run:        never"),
    }
    Ok(())
}
