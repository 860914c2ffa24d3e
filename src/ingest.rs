use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::connector::{CrawlJob, JobSource, SourceConnector};
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{RunOutcome, RunStatus, Source};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub source_code: String,
    pub fetched_count: usize,
    pub inserted_count: usize,
    pub updated_count: usize,
}

/// Crawls one active source through its registered connector.
pub fn run_crawl(db: &Database, source_code: &str) -> Result<CrawlSummary> {
    let source = db
        .get_active_source(source_code)?
        .ok_or_else(|| AppError::not_found(format!("Active source not found: {}", source_code)))?;
    let connector = SourceConnector::for_source(&source.code)?;
    run_crawl_with(db, &source, &connector)
}

/// Fetches from `connector` and upserts every posting under `source`,
/// recording the attempt as a crawl run.
///
/// Postings are written in a single transaction together with the run's
/// `success` finalization. Any failure leaves no job mutations behind and
/// marks the run `failed`.
pub fn run_crawl_with(db: &Database, source: &Source, connector: &dyn JobSource) -> Result<CrawlSummary> {
    let run_id = db.start_run(source.id)?;
    info!(run_id, source = %source.code, connector = connector.source_code(), "crawl run started");

    let jobs = match connector.fetch_jobs() {
        Ok(jobs) => jobs,
        Err(e) => return Err(fail_run(db, run_id, 0, e)?),
    };
    let fetched = jobs.len();

    let tx = db.transaction()?;
    let persisted = persist_jobs(db, source.id, &jobs, Utc::now()).and_then(|(inserted, updated)| {
        db.finish_run(
            run_id,
            &RunOutcome {
                status: RunStatus::Success,
                fetched_count: fetched as i64,
                inserted_count: inserted as i64,
                updated_count: updated as i64,
                failed_count: 0,
                error_message: None,
            },
        )?;
        Ok((inserted, updated))
    });

    let (inserted, updated) = match persisted {
        Ok(counts) => match tx.commit() {
            Ok(()) => counts,
            Err(e) => return Err(fail_run(db, run_id, fetched, e.into())?),
        },
        Err(e) => {
            drop(tx);
            return Err(fail_run(db, run_id, fetched, e)?);
        }
    };

    info!(
        run_id,
        source = %source.code,
        fetched,
        inserted,
        updated,
        "crawl run finished"
    );

    Ok(CrawlSummary {
        run_id,
        status: RunStatus::Success,
        source_code: source.code.clone(),
        fetched_count: fetched,
        inserted_count: inserted,
        updated_count: updated,
    })
}

/// Upserts by `(source_id, source_job_id)`. Returns (inserted, updated).
fn persist_jobs(db: &Database, source_id: i64, jobs: &[CrawlJob], now: DateTime<Utc>) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut updated = 0;
    for job in jobs {
        match db.find_job_id(source_id, &job.source_job_id)? {
            Some(job_id) => {
                db.update_job(job_id, job, now)?;
                updated += 1;
            }
            None => {
                db.insert_job(source_id, job, now)?;
                inserted += 1;
            }
        }
    }
    Ok((inserted, updated))
}

/// Marks the run failed and converts the cause into the error handed to the caller.
fn fail_run(db: &Database, run_id: i64, fetched: usize, cause: AppError) -> Result<AppError> {
    let message = cause.to_string();
    warn!(run_id, error = %message, "crawl run failed");
    db.finish_run(
        run_id,
        &RunOutcome {
            status: RunStatus::Failed,
            fetched_count: fetched as i64,
            inserted_count: 0,
            updated_count: 0,
            failed_count: 1,
            error_message: Some(message.clone()),
        },
    )?;
    Ok(AppError::Run(message))
}
