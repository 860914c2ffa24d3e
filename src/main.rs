mod classify;
mod config;
mod connector;
mod db;
mod error;
mod greenhouse;
mod http;
mod ingest;
mod models;
mod remotive;
mod scheduler;
mod seed;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use connector::{JobSource, SourceConnector};
use db::Database;
use models::{ApplicationStatus, EmploymentType, JobQuery, MAX_PAGE_SIZE, RoleType, SortOption};
use scheduler::CrawlScheduler;

#[derive(Parser)]
#[command(name = "joblog")]
#[command(about = "Job posting aggregator - crawl, classify, and track new-grad openings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Insert default sources and the v1.0.0 rule set
    Seed,

    /// Run the REST API (and the scheduler when SCHEDULER_ENABLED is set)
    Serve {
        /// Bind host (overrides APP_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides APP_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Crawl one source, or every active source
    Crawl {
        /// Source code (remotive, moloco_gh, ...)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Classify recently updated jobs
    Classify {
        /// Rule version (defaults to RULE_VERSION)
        #[arg(short, long)]
        rule_version: Option<String>,

        /// Number of jobs to classify
        #[arg(short, long, default_value = "200")]
        limit: usize,
    },

    /// Show recent crawl runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show classification rules
    Rules {
        /// Rule version (defaults to RULE_VERSION)
        #[arg(short, long)]
        rule_version: Option<String>,
    },

    /// List classified jobs
    List {
        /// Filter by employment type (intern_experience, intern_convertible, new_grad, experienced, unknown)
        #[arg(short, long)]
        employment: Option<EmploymentType>,

        /// Filter by role type; "all" lists every role
        #[arg(short, long, default_value = "backend")]
        role: String,

        /// Company or title substring
        #[arg(short, long)]
        query: Option<String>,

        /// Only postings published at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Sort order (posted_at_desc, deadline_asc, score_desc)
        #[arg(long, default_value = "posted_at_desc")]
        sort: SortOption,

        /// Show inactive postings instead of active ones
        #[arg(long)]
        inactive: bool,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        size: u32,
    },

    /// Show job details
    Show {
        /// Job ID
        id: i64,
    },

    /// Manage bookmarks
    Bookmark {
        #[command(subcommand)]
        command: BookmarkCommands,
    },

    /// Track applications
    Apply {
        #[command(subcommand)]
        command: ApplyCommands,
    },

    /// Fetch every registered source once without saving anything
    CheckSources,
}

#[derive(Subcommand)]
enum BookmarkCommands {
    /// Bookmark a job (replaces the memo if already bookmarked)
    Add {
        job_id: i64,

        #[arg(short, long)]
        memo: Option<String>,
    },

    /// List bookmarks
    List,

    /// Remove a bookmark
    Remove { job_id: i64 },
}

#[derive(Subcommand)]
enum ApplyCommands {
    /// Set the application status for a job
    Set {
        job_id: i64,

        /// planned, applied, interview, rejected, pass
        status: ApplicationStatus,

        /// When the application was sent (RFC 3339)
        #[arg(long)]
        applied_at: Option<DateTime<Utc>>,

        #[arg(short, long)]
        note: Option<String>,
    },

    /// List applications
    List,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("joblog=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;

    match cli.command {
        Commands::Init => {
            let db = Database::open(&settings.database_path).with_context(|| {
                format!("Failed to open database at {}", settings.database_path.display())
            })?;
            db.init()?;
            let path = db.path().unwrap_or(settings.database_path.as_path());
            println!("Database initialized at {}", path.display());
        }

        Commands::Seed => {
            let db = open_db(&settings)?;
            let stats = db.seed_defaults()?;
            println!(
                "Seeded {} source(s) and {} rule(s); existing rows left unchanged.",
                stats.sources_inserted, stats.rules_inserted
            );
        }

        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            serve(settings)?;
        }

        Commands::Crawl { source } => {
            let db = open_db(&settings)?;
            let codes = match source {
                Some(code) => vec![code],
                None => db.list_sources(true)?.into_iter().map(|s| s.code).collect(),
            };
            if codes.is_empty() {
                println!("No active sources. Run 'joblog seed' first.");
            }

            let mut failures = 0;
            for code in codes {
                match ingest::run_crawl(&db, &code) {
                    Ok(summary) => {
                        let elapsed_ms = db
                            .get_run(summary.run_id)?
                            .and_then(|run| run.finished_at.map(|end| (end - run.started_at).num_milliseconds()))
                            .unwrap_or(0);
                        println!(
                            "{:<14} run #{:<5} fetched {:>4}  inserted {:>4}  updated {:>4}  {}ms",
                            summary.source_code,
                            summary.run_id,
                            summary.fetched_count,
                            summary.inserted_count,
                            summary.updated_count,
                            elapsed_ms
                        );
                    }
                    Err(e) => {
                        failures += 1;
                        println!("{:<14} FAILED: {}", code, e);
                    }
                }
            }
            if failures > 0 {
                return Err(anyhow!("{} crawl(s) failed", failures));
            }
        }

        Commands::Classify { rule_version, limit } => {
            let db = open_db(&settings)?;
            let version = rule_version.unwrap_or_else(|| settings.rule_version.clone());
            let summary = classify::classify_jobs(&db, &version, limit)?;
            println!(
                "Classified {} of {} job(s) with rules {}",
                summary.classified_count, summary.processed_count, summary.rule_version
            );
            println!(
                "{} of {} stored job(s) have a verdict under {}",
                db.count_classifications(&summary.rule_version)?,
                db.count_jobs()?,
                summary.rule_version
            );
        }

        Commands::Runs { limit } => {
            let db = open_db(&settings)?;
            let runs = db.list_runs(limit)?;
            if runs.is_empty() {
                println!("No crawl runs yet.");
            } else {
                println!(
                    "{:<6} {:<14} {:<10} {:<20} {:>7} {:>7} {:>7} {:>6}",
                    "ID", "SOURCE", "STATUS", "STARTED", "FETCHED", "NEW", "UPDATED", "FAILED"
                );
                println!("{}", "-".repeat(84));
                for run in runs {
                    println!(
                        "{:<6} {:<14} {:<10} {:<20} {:>7} {:>7} {:>7} {:>6}",
                        run.id,
                        truncate(run.source_code.as_deref().unwrap_or("-"), 12),
                        run.status,
                        run.started_at.format("%Y-%m-%d %H:%M:%S"),
                        run.fetched_count,
                        run.inserted_count,
                        run.updated_count,
                        run.failed_count
                    );
                    if let Some(message) = &run.error_message {
                        println!("       error: {}", truncate(message, 70));
                    }
                }
            }
        }

        Commands::Rules { rule_version } => {
            let db = open_db(&settings)?;
            let version = rule_version.unwrap_or_else(|| settings.rule_version.clone());
            let rules = db.list_rules(&version, false)?;
            if rules.is_empty() {
                println!("No rules for {}.", version);
            } else {
                println!(
                    "{:<6} {:<11} {:<19} {:<26} {:<9} {:>5} {:>6} {:<6}",
                    "ID", "CATEGORY", "TARGET", "KEYWORD", "MATCH", "PRIO", "WEIGHT", "ACTIVE"
                );
                println!("{}", "-".repeat(95));
                for rule in rules {
                    println!(
                        "{:<6} {:<11} {:<19} {:<26} {:<9} {:>5} {:>6} {:<6}",
                        rule.id,
                        rule.category,
                        truncate(&rule.target_value, 17),
                        truncate(&rule.keyword, 24),
                        rule.match_type.as_str(),
                        rule.priority,
                        rule.weight,
                        if rule.is_active { "yes" } else { "no" }
                    );
                }
            }
        }

        Commands::List {
            employment,
            role,
            query,
            since,
            sort,
            inactive,
            page,
            size,
        } => {
            let db = open_db(&settings)?;
            let role_type = match role.trim() {
                "" | "all" => None,
                other => Some(other.parse::<RoleType>()?),
            };
            if page < 1 || !(1..=MAX_PAGE_SIZE).contains(&size) {
                return Err(anyhow!("page must be >= 1 and size between 1 and {}", MAX_PAGE_SIZE));
            }
            let job_query = JobQuery {
                employment_type: employment,
                role_type,
                is_active: !inactive,
                q: query,
                posted_from: since,
                sort,
                page,
                size,
                ..JobQuery::default()
            };

            let result = db.list_jobs(&job_query, &settings.rule_version)?;
            if result.items.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<6} {:<18} {:<9} {:>5} {:<30} {:<18} {:<10}",
                    "ID", "EMPLOYMENT", "ROLE", "SCORE", "TITLE", "COMPANY", "POSTED"
                );
                println!("{}", "-".repeat(102));
                for job in &result.items {
                    println!(
                        "{:<6} {:<18} {:<9} {:>5} {:<30} {:<18} {:<10}",
                        job.job_id,
                        job.employment_type,
                        job.role_type,
                        job.new_grad_score,
                        truncate(&job.title, 28),
                        truncate(&job.company_name, 16),
                        job.posted_at
                            .map(|d| d.format("%Y-%m-%d").to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
                println!(
                    "\nPage {} ({} per page), {} job(s) total",
                    result.page, result.size, result.total
                );
            }
        }

        Commands::Show { id } => {
            let db = open_db(&settings)?;
            match db.job_detail(id, &settings.rule_version)? {
                Some(job) => {
                    println!("Job #{}", job.job_id);
                    println!("Title: {}", job.title);
                    println!("Company: {}", job.company_name);
                    println!("URL: {}", job.url);
                    if let Some(location) = &job.location_text {
                        println!("Location: {}", location);
                    }
                    if let Some(salary) = &job.salary_text {
                        println!("Salary: {}", salary);
                    }
                    if let Some(posted) = job.posted_at {
                        println!("Posted: {}", posted.format("%Y-%m-%d %H:%M"));
                    }
                    if let Some(deadline) = job.deadline_at {
                        println!("Deadline: {}", deadline.format("%Y-%m-%d %H:%M"));
                    }
                    println!("Active: {}", if job.is_active { "yes" } else { "no" });
                    println!(
                        "\nClassification ({}): {} / {} score {} confidence {:.3}",
                        job.rule_version,
                        job.employment_type,
                        job.role_type,
                        job.new_grad_score,
                        job.confidence
                    );
                    match db.get_classification(job.job_id, &job.rule_version)? {
                        Some(verdict) => println!("Classified at {}", verdict.created_at.format("%Y-%m-%d %H:%M")),
                        None => println!("Not classified yet. Run 'joblog classify'."),
                    }
                    for hit in &job.matched_keywords {
                        let rank = match (hit.priority, hit.weight) {
                            (_, Some(weight)) => format!("weight {:+}", weight),
                            (Some(priority), None) => format!("priority {}", priority),
                            (None, None) => String::new(),
                        };
                        println!(
                            "  {:<10} {:<18} '{}' {}",
                            hit.category, hit.target_value, hit.keyword, rank
                        );
                    }
                    if let Some(stack) = &job.tech_stack_text {
                        println!("\nTags: {}", stack);
                    }
                    if let Some(description) = &job.description_text {
                        println!("\n--- Description ---\n{}", description);
                    }
                }
                None => {
                    println!("Job #{} not found.", id);
                }
            }
        }

        Commands::Bookmark { command } => {
            let db = open_db(&settings)?;
            match command {
                BookmarkCommands::Add { job_id, memo } => {
                    let bookmark = db.upsert_bookmark(job_id, memo.as_deref())?;
                    println!("Bookmarked job #{} (bookmark {})", bookmark.job_id, bookmark.id);
                    if let Some(job) = db.get_job(job_id)? {
                        println!("  {} at {}", job.title, job.company_name);
                    }
                }

                BookmarkCommands::List => {
                    let bookmarks = db.list_bookmarks()?;
                    if bookmarks.is_empty() {
                        println!("No bookmarks.");
                    } else {
                        println!("{:<6} {:<30} {:<18} {:<24}", "JOB", "TITLE", "COMPANY", "MEMO");
                        println!("{}", "-".repeat(80));
                        for entry in bookmarks {
                            println!(
                                "{:<6} {:<30} {:<18} {:<24}",
                                entry.bookmark.job_id,
                                truncate(&entry.job.title, 28),
                                truncate(&entry.job.company_name, 16),
                                truncate(entry.bookmark.memo.as_deref().unwrap_or(""), 24)
                            );
                        }
                    }
                }

                BookmarkCommands::Remove { job_id } => {
                    if db.delete_bookmark(job_id)? {
                        println!("Removed bookmark for job #{}.", job_id);
                    } else {
                        println!("Job #{} is not bookmarked.", job_id);
                    }
                }
            }
        }

        Commands::Apply { command } => {
            let db = open_db(&settings)?;
            match command {
                ApplyCommands::Set {
                    job_id,
                    status,
                    applied_at,
                    note,
                } => {
                    let application = db.upsert_application(job_id, status, applied_at, note.as_deref())?;
                    println!("Job #{} marked {}", application.job_id, application.status);
                    if let Some(job) = db.get_job(job_id)? {
                        println!("  {} at {}", job.title, job.company_name);
                    }
                }

                ApplyCommands::List => {
                    let applications = db.list_applications()?;
                    if applications.is_empty() {
                        println!("No applications.");
                    } else {
                        println!(
                            "{:<6} {:<10} {:<30} {:<18} {:<10}",
                            "JOB", "STATUS", "TITLE", "COMPANY", "APPLIED"
                        );
                        println!("{}", "-".repeat(78));
                        for entry in applications {
                            println!(
                                "{:<6} {:<10} {:<30} {:<18} {:<10}",
                                entry.application.job_id,
                                entry.application.status,
                                truncate(&entry.job.title, 28),
                                truncate(&entry.job.company_name, 16),
                                entry
                                    .application
                                    .applied_at
                                    .map(|d| d.format("%Y-%m-%d").to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                    }
                }
            }
        }

        Commands::CheckSources => check_sources()?,
    }

    Ok(())
}

fn open_db(settings: &Settings) -> Result<Database> {
    let db = Database::open(&settings.database_path).with_context(|| {
        format!("Failed to open database at {}", settings.database_path.display())
    })?;
    db.ensure_initialized()?;
    Ok(db)
}

fn serve(settings: Settings) -> Result<()> {
    match Database::open(&settings.database_path).and_then(|db| db.ensure_initialized()) {
        Ok(()) => info!(path = %settings.database_path.display(), "database ok"),
        Err(e) => warn!(error = %e, "database check failed; run 'joblog init' and 'joblog seed'"),
    }

    let settings = Arc::new(settings);
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_server(settings))
}

async fn run_server(settings: Arc<Settings>) -> Result<()> {
    let mut scheduler = if settings.scheduler_enabled {
        let scheduler = CrawlScheduler::new(settings.clone()).await?;
        scheduler.start().await?;
        Some(scheduler)
    } else {
        info!("scheduler disabled");
        None
    };

    let served = server::serve(settings).await;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop().await?;
    }
    served
}

/// Live smoke check of every registered connector.
fn check_sources() -> Result<()> {
    let mut failures = 0;
    for code in SourceConnector::registered_codes() {
        let connector = SourceConnector::for_source(code)?;
        match connector.fetch_jobs() {
            Ok(jobs) => {
                let sample = jobs.first().map(|j| j.title.as_str()).unwrap_or("-");
                println!("{:<14} ok     {:>4} posting(s)  e.g. {}", code, jobs.len(), truncate(sample, 40));
            }
            Err(e) => {
                failures += 1;
                println!("{:<14} FAILED {}", code, e);
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{} source(s) failed", failures));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
