use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior, params};
use tracing::debug;

use crate::classify::{JobText, Verdict};
use crate::connector::CrawlJob;
use crate::error::{AppError, Result};
use crate::models::{
    Application, ApplicationEntry, ApplicationStatus, Bookmark, BookmarkEntry,
    ClassificationRule, CrawlRun, Job, JobClassification, JobDetail, JobListItem, JobQuery,
    JobRef, MatchedKeyword, NewRule, Page, RunOutcome, RunStatus, SortOption, Source,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    crawl_interval_min INTEGER NOT NULL DEFAULT 360,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CONSTRAINT uq_sources_code UNIQUE (code)
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE RESTRICT,
    source_job_id TEXT NOT NULL,
    canonical_url TEXT NOT NULL,
    company_name TEXT NOT NULL,
    title TEXT NOT NULL,
    description_text TEXT,
    location_text TEXT,
    employment_text_raw TEXT,
    experience_text_raw TEXT,
    tech_stack_text TEXT,
    salary_text TEXT,
    posted_at TEXT,
    deadline_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CONSTRAINT uq_jobs_canonical_url UNIQUE (canonical_url),
    CONSTRAINT uq_jobs_source_id_source_job_id UNIQUE (source_id, source_job_id)
);
CREATE INDEX IF NOT EXISTS idx_jobs_active ON jobs(is_active);
CREATE INDEX IF NOT EXISTS idx_jobs_posted_at ON jobs(posted_at);
CREATE INDEX IF NOT EXISTS idx_jobs_deadline_at ON jobs(deadline_at);
CREATE INDEX IF NOT EXISTS idx_jobs_company_title ON jobs(company_name, title);

CREATE TABLE IF NOT EXISTS classification_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_version TEXT NOT NULL,
    category TEXT NOT NULL,
    target_value TEXT NOT NULL,
    keyword TEXT NOT NULL,
    match_type TEXT NOT NULL DEFAULT 'contains',
    priority INTEGER NOT NULL DEFAULT 100,
    weight INTEGER NOT NULL DEFAULT 0,
    is_negation INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    CONSTRAINT uq_classification_rules_unique_set
        UNIQUE (rule_version, category, target_value, keyword, is_negation)
);
CREATE INDEX IF NOT EXISTS idx_rules_active
    ON classification_rules(rule_version, category, is_active, priority);

CREATE TABLE IF NOT EXISTS job_classifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    rule_version TEXT NOT NULL,
    employment_type TEXT NOT NULL DEFAULT 'unknown'
        CHECK (employment_type IN ('intern_experience', 'intern_convertible', 'new_grad', 'experienced', 'unknown')),
    role_type TEXT NOT NULL DEFAULT 'unknown'
        CHECK (role_type IN ('backend', 'frontend', 'fullstack', 'data', 'mobile', 'devops', 'unknown')),
    new_grad_score INTEGER NOT NULL DEFAULT 0 CHECK (new_grad_score BETWEEN 0 AND 100),
    confidence REAL NOT NULL DEFAULT 0.5 CHECK (confidence BETWEEN 0 AND 1),
    matched_keywords TEXT NOT NULL DEFAULT '[]',
    reasoning TEXT,
    created_at TEXT NOT NULL,
    CONSTRAINT uq_job_classifications_job_id_rule_version UNIQUE (job_id, rule_version)
);
CREATE INDEX IF NOT EXISTS idx_job_classifications_employment ON job_classifications(employment_type);
CREATE INDEX IF NOT EXISTS idx_job_classifications_role ON job_classifications(role_type);
CREATE INDEX IF NOT EXISTS idx_job_classifications_score ON job_classifications(new_grad_score);

CREATE TABLE IF NOT EXISTS crawl_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER REFERENCES sources(id) ON DELETE SET NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL DEFAULT 'running'
        CHECK (status IN ('running', 'success', 'partial_fail', 'failed')),
    fetched_count INTEGER NOT NULL DEFAULT 0,
    inserted_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_crawl_runs_source_started ON crawl_runs(source_id, started_at);

CREATE TABLE IF NOT EXISTS bookmarks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    memo TEXT,
    created_at TEXT NOT NULL,
    CONSTRAINT uq_bookmarks_job_id UNIQUE (job_id)
);

CREATE TABLE IF NOT EXISTS applications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'planned'
        CHECK (status IN ('planned', 'applied', 'interview', 'rejected', 'pass')),
    applied_at TEXT,
    note TEXT,
    updated_at TEXT NOT NULL,
    CONSTRAINT uq_applications_job_id UNIQUE (job_id)
);
"#;

const JOB_COLUMNS: &str = "id, source_id, source_job_id, canonical_url, company_name, title,
    description_text, location_text, employment_text_raw, experience_text_raw,
    tech_stack_text, salary_text, posted_at, deadline_at, is_active,
    first_seen_at, last_seen_at, created_at, updated_at";

const RULE_COLUMNS: &str = "id, rule_version, category, target_value, keyword, match_type,
    priority, weight, is_negation, is_active";

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(AppError::validation(
                "Database not initialized. Run 'joblog init' first.",
            ));
        }
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Starts a write transaction on the shared connection. Every other method
    /// called while it is open takes part in it. The write lock is taken up
    /// front, so a concurrent writer makes this wait out `busy_timeout`.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // --- Sources ---

    /// Inserts a source unless its code already exists. Returns true if inserted.
    pub fn insert_source(
        &self,
        code: &str,
        name: &str,
        base_url: &str,
        crawl_interval_min: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sources (code, name, base_url, is_active, crawl_interval_min, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
            params![code, name, base_url, crawl_interval_min, now],
        )?;
        Ok(inserted > 0)
    }

    pub fn set_source_active(&self, code: &str, is_active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE sources SET is_active = ?1, updated_at = ?2 WHERE code = ?3",
            params![is_active, Utc::now(), code],
        )?;
        if changed == 0 {
            return Err(AppError::not_found(format!("Source not found: {}", code)));
        }
        Ok(())
    }

    pub fn get_active_source(&self, code: &str) -> Result<Option<Source>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, code, name, base_url, is_active, crawl_interval_min, created_at, updated_at
                 FROM sources WHERE code = ?1 AND is_active = 1",
                [code],
                Self::row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    pub fn list_sources(&self, active_only: bool) -> Result<Vec<Source>> {
        let mut sql = String::from(
            "SELECT id, code, name, base_url, is_active, crawl_interval_min, created_at, updated_at
             FROM sources",
        );
        if active_only {
            sql.push_str(" WHERE is_active = 1");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_source)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn row_to_source(row: &rusqlite::Row) -> rusqlite::Result<Source> {
        Ok(Source {
            id: row.get(0)?,
            code: row.get(1)?,
            name: row.get(2)?,
            base_url: row.get(3)?,
            is_active: row.get(4)?,
            crawl_interval_min: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    // --- Jobs ---

    pub fn find_job_id(&self, source_id: i64, source_job_id: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM jobs WHERE source_id = ?1 AND source_job_id = ?2",
                params![source_id, source_job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn insert_job(&self, source_id: i64, job: &CrawlJob, now: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO jobs (
                source_id, source_job_id, canonical_url, company_name, title,
                description_text, location_text, employment_text_raw,
                experience_text_raw, tech_stack_text, salary_text,
                posted_at, deadline_at, is_active,
                first_seen_at, last_seen_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14, ?14, ?14, ?14)",
            params![
                source_id,
                job.source_job_id,
                job.canonical_url,
                job.company_name,
                job.title,
                job.description_text,
                job.location_text,
                job.employment_text_raw,
                job.experience_text_raw,
                job.tech_stack_text,
                job.salary_text,
                job.posted_at,
                job.deadline_at,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Refreshes every mutable field and reactivates the job. `first_seen_at`
    /// is never touched.
    pub fn update_job(&self, job_id: i64, job: &CrawlJob, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs
             SET canonical_url = ?1,
                 company_name = ?2,
                 title = ?3,
                 description_text = ?4,
                 location_text = ?5,
                 employment_text_raw = ?6,
                 experience_text_raw = ?7,
                 tech_stack_text = ?8,
                 salary_text = ?9,
                 posted_at = ?10,
                 deadline_at = ?11,
                 is_active = 1,
                 last_seen_at = ?12,
                 updated_at = ?12
             WHERE id = ?13",
            params![
                job.canonical_url,
                job.company_name,
                job.title,
                job.description_text,
                job.location_text,
                job.employment_text_raw,
                job.experience_text_raw,
                job.tech_stack_text,
                job.salary_text,
                job.posted_at,
                job.deadline_at,
                now,
                job_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let job = self.conn.query_row(&sql, [id], Self::row_to_job).optional()?;
        Ok(job)
    }

    pub fn job_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_jobs(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
    }

    /// Freshest-first: latest update, then newest insert.
    pub fn jobs_for_classification(&self, limit: usize) -> Result<Vec<JobText>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description_text, employment_text_raw, experience_text_raw, tech_stack_text
             FROM jobs
             ORDER BY updated_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(JobText {
                job_id: row.get(0)?,
                title: row.get(1)?,
                description_text: row.get(2)?,
                employment_text_raw: row.get(3)?,
                experience_text_raw: row.get(4)?,
                tech_stack_text: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        Ok(Job {
            id: row.get(0)?,
            source_id: row.get(1)?,
            source_job_id: row.get(2)?,
            canonical_url: row.get(3)?,
            company_name: row.get(4)?,
            title: row.get(5)?,
            description_text: row.get(6)?,
            location_text: row.get(7)?,
            employment_text_raw: row.get(8)?,
            experience_text_raw: row.get(9)?,
            tech_stack_text: row.get(10)?,
            salary_text: row.get(11)?,
            posted_at: row.get(12)?,
            deadline_at: row.get(13)?,
            is_active: row.get(14)?,
            first_seen_at: row.get(15)?,
            last_seen_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    // --- Rules ---

    /// Inserts a rule unless an identical one exists. Returns true if inserted.
    pub fn insert_rule(&self, rule: &NewRule) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO classification_rules (
                rule_version, category, target_value, keyword, match_type,
                priority, weight, is_negation, is_active, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.rule_version,
                rule.category,
                rule.target_value,
                rule.keyword,
                rule.match_type,
                rule.priority,
                rule.weight,
                rule.is_negation,
                rule.is_active,
                Utc::now(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Rules of one version, ordered by `(category, priority, id)`.
    pub fn list_rules(&self, rule_version: &str, active_only: bool) -> Result<Vec<ClassificationRule>> {
        let mut sql = format!(
            "SELECT {} FROM classification_rules WHERE rule_version = ?1",
            RULE_COLUMNS
        );
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY category, priority ASC, id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([rule_version], |row| {
            Ok(ClassificationRule {
                id: row.get(0)?,
                rule_version: row.get(1)?,
                category: row.get(2)?,
                target_value: row.get(3)?,
                keyword: row.get(4)?,
                match_type: row.get(5)?,
                priority: row.get(6)?,
                weight: row.get(7)?,
                is_negation: row.get(8)?,
                is_active: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- Classifications ---

    pub fn upsert_classification(&self, job_id: i64, rule_version: &str, verdict: &Verdict) -> Result<()> {
        let matched = serde_json::to_string(&verdict.matched_keywords)?;
        self.conn.execute(
            "INSERT INTO job_classifications (
                job_id, rule_version, employment_type, role_type,
                new_grad_score, confidence, matched_keywords, reasoning, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (job_id, rule_version) DO UPDATE SET
                employment_type = excluded.employment_type,
                role_type = excluded.role_type,
                new_grad_score = excluded.new_grad_score,
                confidence = excluded.confidence,
                matched_keywords = excluded.matched_keywords,
                reasoning = excluded.reasoning,
                created_at = excluded.created_at",
            params![
                job_id,
                rule_version,
                verdict.employment_type,
                verdict.role_type,
                verdict.new_grad_score,
                verdict.confidence,
                matched,
                verdict.reasoning,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_classification(&self, job_id: i64, rule_version: &str) -> Result<Option<JobClassification>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, job_id, rule_version, employment_type, role_type, new_grad_score,
                        confidence, matched_keywords, reasoning, created_at
                 FROM job_classifications WHERE job_id = ?1 AND rule_version = ?2",
                params![job_id, rule_version],
                |row| {
                    let raw: String = row.get(7)?;
                    Ok(JobClassification {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        rule_version: row.get(2)?,
                        employment_type: row.get(3)?,
                        role_type: row.get(4)?,
                        new_grad_score: row.get(5)?,
                        confidence: row.get(6)?,
                        matched_keywords: parse_matches(7, &raw)?,
                        reasoning: row.get(8)?,
                        created_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_classifications(&self, rule_version: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM job_classifications WHERE rule_version = ?1",
            [rule_version],
            |row| row.get(0),
        )?)
    }

    // --- Crawl runs ---

    pub fn start_run(&self, source_id: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO crawl_runs (source_id, status, started_at) VALUES (?1, ?2, ?3)",
            params![source_id, RunStatus::Running, Utc::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        self.conn.execute(
            "UPDATE crawl_runs
             SET finished_at = ?1,
                 status = ?2,
                 fetched_count = ?3,
                 inserted_count = ?4,
                 updated_count = ?5,
                 failed_count = ?6,
                 error_message = ?7
             WHERE id = ?8",
            params![
                Utc::now(),
                outcome.status,
                outcome.fetched_count,
                outcome.inserted_count,
                outcome.updated_count,
                outcome.failed_count,
                outcome.error_message,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<CrawlRun>> {
        let sql = format!("{} WHERE cr.id = ?1", RUN_SELECT);
        Ok(self.conn.query_row(&sql, [run_id], Self::row_to_run).optional()?)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<CrawlRun>> {
        let sql = format!("{} ORDER BY cr.started_at DESC, cr.id DESC LIMIT ?1", RUN_SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], Self::row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<CrawlRun> {
        Ok(CrawlRun {
            id: row.get(0)?,
            source_id: row.get(1)?,
            source_code: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            fetched_count: row.get(6)?,
            inserted_count: row.get(7)?,
            updated_count: row.get(8)?,
            failed_count: row.get(9)?,
            error_message: row.get(10)?,
        })
    }

    // --- Bookmarks ---

    pub fn upsert_bookmark(&self, job_id: i64, memo: Option<&str>) -> Result<Bookmark> {
        if !self.job_exists(job_id)? {
            return Err(AppError::not_found("Job not found"));
        }
        let bookmark = self.conn.query_row(
            "INSERT INTO bookmarks (job_id, memo, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (job_id) DO UPDATE SET memo = excluded.memo
             RETURNING id, job_id, memo, created_at",
            params![job_id, memo, Utc::now()],
            |row| {
                Ok(Bookmark {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    memo: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )?;
        Ok(bookmark)
    }

    pub fn list_bookmarks(&self) -> Result<Vec<BookmarkEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.id, b.job_id, b.memo, b.created_at, j.title, j.company_name, j.canonical_url
             FROM bookmarks b
             JOIN jobs j ON j.id = b.job_id
             ORDER BY b.created_at DESC, b.id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BookmarkEntry {
                bookmark: Bookmark {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    memo: row.get(2)?,
                    created_at: row.get(3)?,
                },
                job: JobRef {
                    title: row.get(4)?,
                    company_name: row.get(5)?,
                    url: row.get(6)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns false when the job had no bookmark.
    pub fn delete_bookmark(&self, job_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM bookmarks WHERE job_id = ?1", [job_id])?;
        Ok(deleted > 0)
    }

    // --- Applications ---

    pub fn upsert_application(
        &self,
        job_id: i64,
        status: ApplicationStatus,
        applied_at: Option<DateTime<Utc>>,
        note: Option<&str>,
    ) -> Result<Application> {
        if !self.job_exists(job_id)? {
            return Err(AppError::not_found("Job not found"));
        }
        let application = self.conn.query_row(
            "INSERT INTO applications (job_id, status, applied_at, note, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (job_id) DO UPDATE SET
                status = excluded.status,
                applied_at = excluded.applied_at,
                note = excluded.note,
                updated_at = excluded.updated_at
             RETURNING id, job_id, status, applied_at, note, updated_at",
            params![job_id, status, applied_at, note, Utc::now()],
            Self::row_to_application,
        )?;
        Ok(application)
    }

    pub fn list_applications(&self) -> Result<Vec<ApplicationEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.job_id, a.status, a.applied_at, a.note, a.updated_at,
                    j.title, j.company_name, j.canonical_url
             FROM applications a
             JOIN jobs j ON j.id = a.job_id
             ORDER BY a.updated_at DESC, a.id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ApplicationEntry {
                application: Self::row_to_application(row)?,
                job: JobRef {
                    title: row.get(6)?,
                    company_name: row.get(7)?,
                    url: row.get(8)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
        Ok(Application {
            id: row.get(0)?,
            job_id: row.get(1)?,
            status: row.get(2)?,
            applied_at: row.get(3)?,
            note: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    // --- Listing / detail joined with the configured rule version ---

    pub fn list_jobs(&self, query: &JobQuery, rule_version: &str) -> Result<Page<JobListItem>> {
        let mut clauses = vec!["j.is_active = ?".to_string()];
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(rule_version.to_string()), Box::new(query.is_active)];

        if let Some(employment) = query.employment_type {
            clauses.push("jc.employment_type = ?".to_string());
            args.push(Box::new(employment));
        }
        if let Some(role) = query.role_type {
            clauses.push("jc.role_type = ?".to_string());
            args.push(Box::new(role));
        }
        if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let like = format!("%{}%", q);
            clauses.push("(j.company_name LIKE ? OR j.title LIKE ?)".to_string());
            args.push(Box::new(like.clone()));
            args.push(Box::new(like));
        }
        if let Some(from) = query.posted_from {
            clauses.push("j.posted_at >= ?".to_string());
            args.push(Box::new(from));
        }
        if let Some(to) = query.posted_to {
            clauses.push("j.posted_at <= ?".to_string());
            args.push(Box::new(to));
        }
        if let Some(deadline) = query.deadline_before {
            clauses.push("j.deadline_at <= ?".to_string());
            args.push(Box::new(deadline));
        }

        let base_from = format!(
            "FROM jobs j
             LEFT JOIN job_classifications jc ON jc.job_id = j.id AND jc.rule_version = ?
             WHERE {}",
            clauses.join(" AND ")
        );

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) {}", base_from),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let order = match query.sort {
            SortOption::PostedAtDesc => "j.posted_at DESC NULLS LAST, j.id DESC",
            SortOption::DeadlineAsc => "j.deadline_at ASC NULLS LAST, j.id DESC",
            SortOption::ScoreDesc => "jc.new_grad_score DESC NULLS LAST, j.posted_at DESC NULLS LAST, j.id DESC",
        };
        let sql = format!(
            "SELECT j.id, j.title, j.company_name, j.canonical_url,
                    COALESCE(jc.employment_type, 'unknown'),
                    COALESCE(jc.role_type, 'unknown'),
                    COALESCE(jc.new_grad_score, 0),
                    j.posted_at, j.deadline_at, j.is_active
             {}
             ORDER BY {}
             LIMIT ? OFFSET ?",
            base_from, order
        );

        let page = query.page.max(1);
        let offset = (i64::from(page) - 1) * i64::from(query.size);
        args.push(Box::new(i64::from(query.size)));
        args.push(Box::new(offset));

        debug!(%sql, "listing jobs");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(JobListItem {
                job_id: row.get(0)?,
                title: row.get(1)?,
                company_name: row.get(2)?,
                url: row.get(3)?,
                employment_type: row.get(4)?,
                role_type: row.get(5)?,
                new_grad_score: row.get(6)?,
                posted_at: row.get(7)?,
                deadline_at: row.get(8)?,
                is_active: row.get(9)?,
            })
        })?;
        let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page,
            size: query.size,
            total,
        })
    }

    pub fn job_detail(&self, job_id: i64, rule_version: &str) -> Result<Option<JobDetail>> {
        let detail = self
            .conn
            .query_row(
                "SELECT j.id, j.title, j.company_name, j.canonical_url,
                        j.description_text, j.location_text, j.employment_text_raw,
                        j.experience_text_raw, j.tech_stack_text, j.salary_text,
                        COALESCE(jc.employment_type, 'unknown'),
                        COALESCE(jc.role_type, 'unknown'),
                        COALESCE(jc.new_grad_score, 0),
                        COALESCE(jc.confidence, 0.5),
                        COALESCE(jc.matched_keywords, '[]'),
                        jc.reasoning,
                        COALESCE(jc.rule_version, ?2),
                        j.posted_at, j.deadline_at, j.is_active
                 FROM jobs j
                 LEFT JOIN job_classifications jc ON jc.job_id = j.id AND jc.rule_version = ?2
                 WHERE j.id = ?1",
                params![job_id, rule_version],
                |row| {
                    let raw: String = row.get(14)?;
                    Ok(JobDetail {
                        job_id: row.get(0)?,
                        title: row.get(1)?,
                        company_name: row.get(2)?,
                        url: row.get(3)?,
                        description_text: row.get(4)?,
                        location_text: row.get(5)?,
                        employment_text_raw: row.get(6)?,
                        experience_text_raw: row.get(7)?,
                        tech_stack_text: row.get(8)?,
                        salary_text: row.get(9)?,
                        employment_type: row.get(10)?,
                        role_type: row.get(11)?,
                        new_grad_score: row.get(12)?,
                        confidence: row.get(13)?,
                        matched_keywords: parse_matches(14, &raw)?,
                        reasoning: row.get(15)?,
                        rule_version: row.get(16)?,
                        posted_at: row.get(17)?,
                        deadline_at: row.get(18)?,
                        is_active: row.get(19)?,
                    })
                },
            )
            .optional()?;
        Ok(detail)
    }
}

const RUN_SELECT: &str = "SELECT cr.id, cr.source_id, s.code, cr.status, cr.started_at, cr.finished_at,
        cr.fetched_count, cr.inserted_count, cr.updated_count, cr.failed_count, cr.error_message
     FROM crawl_runs cr
     LEFT JOIN sources s ON s.id = cr.source_id";

fn parse_matches(column: usize, raw: &str) -> rusqlite::Result<Vec<MatchedKeyword>> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmploymentType, RoleType};
    use chrono::TimeZone;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db.insert_source("remotive", "Remotive", "https://remotive.com", 360)
            .unwrap();
        db
    }

    fn source_id(db: &Database) -> i64 {
        db.get_active_source("remotive").unwrap().unwrap().id
    }

    fn posting(id: &str, title: &str) -> CrawlJob {
        CrawlJob::new(id, &format!("https://jobs.test/{}", id), "Acme", title)
    }

    fn verdict(employment: EmploymentType, role: RoleType, score: i32) -> Verdict {
        Verdict {
            employment_type: employment,
            role_type: role,
            new_grad_score: score,
            confidence: 0.9,
            matched_keywords: vec![],
            reasoning: "test".to_string(),
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let db = test_db();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_ensure_initialized_fails_on_empty_db() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_initialized().is_err());
    }

    #[test]
    fn test_insert_source_ignores_duplicates() {
        let db = test_db();
        assert!(!db.insert_source("remotive", "Other", "https://x.test", 10).unwrap());
        let sources = db.list_sources(false).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "Remotive");
    }

    #[test]
    fn test_inactive_source_is_hidden() {
        let db = test_db();
        db.set_source_active("remotive", false).unwrap();
        assert!(db.get_active_source("remotive").unwrap().is_none());
        assert!(db.list_sources(true).unwrap().is_empty());
        assert!(db.set_source_active("nope", true).is_err());
    }

    #[test]
    fn test_insert_and_update_job_keeps_first_seen() {
        let db = test_db();
        let sid = source_id(&db);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let id = db.insert_job(sid, &posting("1", "Backend Engineer"), t0).unwrap();
        assert_eq!(db.find_job_id(sid, "1").unwrap(), Some(id));

        db.conn
            .execute("UPDATE jobs SET is_active = 0 WHERE id = ?1", [id])
            .unwrap();
        db.update_job(id, &posting("1", "Senior Backend Engineer"), t1)
            .unwrap();

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.title, "Senior Backend Engineer");
        assert!(job.is_active);
        assert_eq!(job.first_seen_at, t0);
        assert_eq!(job.last_seen_at, t1);
    }

    #[test]
    fn test_canonical_url_is_unique() {
        let db = test_db();
        let sid = source_id(&db);
        let now = Utc::now();
        db.insert_job(sid, &posting("1", "A"), now).unwrap();
        let mut clash = posting("2", "B");
        clash.canonical_url = "https://jobs.test/1".to_string();
        assert!(db.insert_job(sid, &clash, now).is_err());
    }

    #[test]
    fn test_rules_are_unique_and_ordered() {
        let db = test_db();
        assert!(db.insert_rule(&NewRule::new("v1", "role", "backend", "backend").priority(20)).unwrap());
        assert!(!db.insert_rule(&NewRule::new("v1", "role", "backend", "backend").priority(5)).unwrap());
        db.insert_rule(&NewRule::new("v1", "role", "data", "data").priority(10)).unwrap();
        db.insert_rule(&NewRule::new("v1", "employment", "new_grad", "new grad").priority(50)).unwrap();
        db.insert_rule(&NewRule::new("v1", "role", "mobile", "ios").inactive()).unwrap();
        db.insert_rule(&NewRule::new("v2", "role", "data", "data")).unwrap();

        let rules = db.list_rules("v1", true).unwrap();
        let keys: Vec<(&str, i32)> = rules
            .iter()
            .map(|r| (r.category.as_str(), r.priority))
            .collect();
        assert_eq!(keys, vec![("employment", 50), ("role", 10), ("role", 20)]);
        assert_eq!(db.list_rules("v1", false).unwrap().len(), 4);
    }

    #[test]
    fn test_upsert_classification_replaces_row() {
        let db = test_db();
        let sid = source_id(&db);
        let id = db.insert_job(sid, &posting("1", "Backend"), Utc::now()).unwrap();

        db.upsert_classification(id, "v1", &verdict(EmploymentType::NewGrad, RoleType::Backend, 70))
            .unwrap();
        let first = db.get_classification(id, "v1").unwrap().unwrap();

        db.upsert_classification(id, "v1", &verdict(EmploymentType::Experienced, RoleType::Data, 30))
            .unwrap();
        let second = db.get_classification(id, "v1").unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.employment_type, EmploymentType::Experienced);
        assert_eq!(second.role_type, RoleType::Data);
        assert_eq!(second.new_grad_score, 30);
        assert_eq!(db.count_classifications("v1").unwrap(), 1);
    }

    #[test]
    fn test_run_lifecycle() {
        let db = test_db();
        let sid = source_id(&db);
        let run_id = db.start_run(sid).unwrap();

        let run = db.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        db.finish_run(
            run_id,
            &RunOutcome {
                status: RunStatus::Success,
                fetched_count: 3,
                inserted_count: 2,
                updated_count: 1,
                failed_count: 0,
                error_message: None,
            },
        )
        .unwrap();

        let runs = db.list_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].source_code.as_deref(), Some("remotive"));
        assert_eq!(runs[0].inserted_count, 2);
        assert!(runs[0].finished_at.is_some());
    }

    #[test]
    fn test_bookmark_upsert_and_delete() {
        let db = test_db();
        let sid = source_id(&db);
        let id = db.insert_job(sid, &posting("1", "Backend"), Utc::now()).unwrap();

        let first = db.upsert_bookmark(id, Some("look later")).unwrap();
        let second = db.upsert_bookmark(id, Some("apply this week")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.memo.as_deref(), Some("apply this week"));

        let listed = db.list_bookmarks().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job.title, "Backend");

        assert!(db.delete_bookmark(id).unwrap());
        assert!(!db.delete_bookmark(id).unwrap());
    }

    #[test]
    fn test_bookmark_requires_job() {
        let db = test_db();
        let err = db.upsert_bookmark(999, None).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_application_upsert() {
        let db = test_db();
        let sid = source_id(&db);
        let id = db.insert_job(sid, &posting("1", "Backend"), Utc::now()).unwrap();

        db.upsert_application(id, ApplicationStatus::Planned, None, None)
            .unwrap();
        let applied_at = Utc.with_ymd_and_hms(2026, 2, 20, 9, 0, 0).unwrap();
        let app = db
            .upsert_application(id, ApplicationStatus::Applied, Some(applied_at), Some("sent"))
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert_eq!(app.applied_at, Some(applied_at));

        let listed = db.list_applications().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].application.note.as_deref(), Some("sent"));
        assert!(matches!(
            db.upsert_application(404, ApplicationStatus::Pass, None, None),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_jobs_filters_and_sorts() {
        let db = test_db();
        let sid = source_id(&db);
        let now = Utc::now();

        let mut a = posting("a", "Backend Engineer");
        a.posted_at = Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        let mut b = posting("b", "Junior Backend Developer");
        b.posted_at = Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap());
        let mut c = posting("c", "iOS Engineer");
        c.posted_at = Some(Utc.with_ymd_and_hms(2026, 2, 5, 0, 0, 0).unwrap());

        let ida = db.insert_job(sid, &a, now).unwrap();
        let idb = db.insert_job(sid, &b, now).unwrap();
        let idc = db.insert_job(sid, &c, now).unwrap();

        db.upsert_classification(ida, "v1", &verdict(EmploymentType::Experienced, RoleType::Backend, 40)).unwrap();
        db.upsert_classification(idb, "v1", &verdict(EmploymentType::NewGrad, RoleType::Backend, 90)).unwrap();
        db.upsert_classification(idc, "v1", &verdict(EmploymentType::NewGrad, RoleType::Mobile, 60)).unwrap();

        // default: backend only, newest posting first
        let page = db.list_jobs(&JobQuery::default(), "v1").unwrap();
        assert_eq!(page.total, 2);
        let ids: Vec<i64> = page.items.iter().map(|i| i.job_id).collect();
        assert_eq!(ids, vec![idb, ida]);

        let by_score = JobQuery {
            role_type: None,
            sort: SortOption::ScoreDesc,
            ..JobQuery::default()
        };
        let ids: Vec<i64> = db.list_jobs(&by_score, "v1").unwrap().items.iter().map(|i| i.job_id).collect();
        assert_eq!(ids, vec![idb, idc, ida]);

        let new_grads = JobQuery {
            role_type: None,
            employment_type: Some(EmploymentType::NewGrad),
            q: Some("junior".to_string()),
            ..JobQuery::default()
        };
        let page = db.list_jobs(&new_grads, "v1").unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].job_id, idb);

        let window = JobQuery {
            role_type: None,
            posted_from: Some(Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).unwrap()),
            posted_to: Some(Utc.with_ymd_and_hms(2026, 2, 6, 0, 0, 0).unwrap()),
            ..JobQuery::default()
        };
        let page = db.list_jobs(&window, "v1").unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].job_id, idc);
    }

    #[test]
    fn test_list_jobs_paginates_and_defaults_unclassified() {
        let db = test_db();
        let sid = source_id(&db);
        for i in 0..5 {
            db.insert_job(sid, &posting(&i.to_string(), "Engineer"), Utc::now()).unwrap();
        }
        let query = JobQuery {
            role_type: None,
            page: 2,
            size: 2,
            ..JobQuery::default()
        };
        let page = db.list_jobs(&query, "v1").unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.page, 2);
        assert!(page.items.iter().all(|i| i.employment_type == EmploymentType::Unknown));
        assert!(page.items.iter().all(|i| i.new_grad_score == 0));
    }

    #[test]
    fn test_job_detail_falls_back_without_classification() {
        let db = test_db();
        let sid = source_id(&db);
        let id = db.insert_job(sid, &posting("1", "Backend"), Utc::now()).unwrap();

        let detail = db.job_detail(id, "v9").unwrap().unwrap();
        assert_eq!(detail.employment_type, EmploymentType::Unknown);
        assert_eq!(detail.confidence, 0.5);
        assert!(detail.matched_keywords.is_empty());
        assert_eq!(detail.rule_version, "v9");
        assert!(db.job_detail(999, "v9").unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("joblog.db");
        let db = Database::open(&path).unwrap();
        db.init().unwrap();
        db.ping().unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[test]
    fn test_transaction_takes_write_lock_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joblog.db");
        let db = Database::open(&path).unwrap();
        db.init().unwrap();
        let other = Database::open(&path).unwrap();
        other.conn.busy_timeout(Duration::ZERO).unwrap();

        let tx = db.transaction().unwrap();
        // no statement has run yet, but the lock is already held
        assert!(other.execute_raw("BEGIN IMMEDIATE").is_err());
        drop(tx);

        other.execute_raw("BEGIN IMMEDIATE; ROLLBACK;").unwrap();
    }
}
