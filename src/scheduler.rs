use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::classify::{ClassifySummary, classify_jobs};
use crate::config::Settings;
use crate::db::Database;
use crate::error::Result;
use crate::ingest::{CrawlSummary, run_crawl};

/// Allows at most one crawl-and-classify pass in flight.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

/// Held for the duration of a pass; releases the guard on drop.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` while another pass holds the guard.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                running: Arc::clone(&self.running),
            })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub crawls: Vec<CrawlSummary>,
    pub failed_sources: Vec<String>,
    pub classify: ClassifySummary,
}

/// Crawls every active source in turn, then classifies the freshest jobs.
/// A source that fails is logged and skipped; classification still runs.
pub fn crawl_and_classify_once(settings: &Settings) -> Result<PassReport> {
    let db = Database::open(&settings.database_path)?;
    db.ensure_initialized()?;

    let mut crawls = Vec::new();
    let mut failed_sources = Vec::new();
    for source in db.list_sources(true)? {
        match run_crawl(&db, &source.code) {
            Ok(summary) => crawls.push(summary),
            Err(e) => {
                warn!(source = %source.code, error = %e, "scheduled crawl failed");
                failed_sources.push(source.code);
            }
        }
    }

    let classify = classify_jobs(&db, &settings.rule_version, settings.classify_limit)?;
    Ok(PassReport {
        crawls,
        failed_sources,
        classify,
    })
}

/// Owns the cron scheduler that drives [`crawl_and_classify_once`].
pub struct CrawlScheduler {
    inner: JobScheduler,
    cron: String,
}

impl CrawlScheduler {
    pub async fn new(settings: Arc<Settings>) -> Result<Self> {
        let inner = JobScheduler::new().await?;
        let guard = RunGuard::new();
        let cron = settings.scheduler_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let settings = Arc::clone(&settings);
            let guard = guard.clone();
            Box::pin(async move {
                run_pass(settings, guard).await;
            })
        })?;
        inner.add(job).await?;

        Ok(Self { inner, cron })
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await?;
        info!(cron = %self.cron, "scheduler started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        info!("scheduler stopped");
        Ok(())
    }
}

async fn run_pass(settings: Arc<Settings>, guard: RunGuard) {
    let Some(permit) = guard.try_acquire() else {
        info!("previous scheduled pass still running, skipping trigger");
        return;
    };

    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        crawl_and_classify_once(&settings)
    })
    .await;

    match result {
        Ok(Ok(report)) => info!(
            crawled = report.crawls.len(),
            failed = report.failed_sources.len(),
            classified = report.classify.classified_count,
            "scheduled pass finished"
        ),
        Ok(Err(e)) => error!(error = %e, "scheduled pass failed"),
        Err(e) => error!(error = %e, "scheduled pass panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRule;

    #[test]
    fn test_guard_allows_one_holder() {
        let guard = RunGuard::new();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());
        assert!(guard.clone().try_acquire().is_none());

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    fn temp_settings(dir: &tempfile::TempDir) -> Settings {
        Settings {
            database_path: dir.path().join("joblog.db"),
            rule_version: "v1".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_pass_requires_initialized_database() {
        let dir = tempfile::tempdir().unwrap();
        assert!(crawl_and_classify_once(&temp_settings(&dir)).is_err());
    }

    #[test]
    fn test_pass_classifies_without_active_sources() {
        let dir = tempfile::tempdir().unwrap();
        let settings = temp_settings(&dir);
        {
            let db = Database::open(&settings.database_path).unwrap();
            db.init().unwrap();
            db.insert_rule(&NewRule::new("v1", "role", "backend", "backend"))
                .unwrap();
        }

        let report = crawl_and_classify_once(&settings).unwrap();
        assert!(report.crawls.is_empty());
        assert!(report.failed_sources.is_empty());
        assert_eq!(report.classify.rule_version, "v1");
        assert_eq!(report.classify.processed_count, 0);
    }

    #[tokio::test]
    async fn test_trigger_is_dropped_while_pass_runs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(temp_settings(&dir));
        let guard = RunGuard::new();

        let held = guard.try_acquire().unwrap();
        // would fail on the uninitialized database if it ran
        run_pass(settings, guard.clone()).await;
        assert!(guard.is_running());
        assert!(!dir.path().join("joblog.db").exists());
        drop(held);
    }

    #[tokio::test]
    async fn test_scheduler_builds_with_default_cron() {
        let settings = Arc::new(Settings::default());
        let scheduler = CrawlScheduler::new(settings).await.unwrap();
        assert_eq!(scheduler.cron, Settings::default().scheduler_cron);
    }
}
