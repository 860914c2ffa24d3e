use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::classify::{ClassifySummary, classify_jobs};
use crate::config::Settings;
use crate::db::Database;
use crate::error::AppError;
use crate::ingest::{CrawlSummary, run_crawl};
use crate::models::{
    Application, ApplicationEntry, ApplicationStatus, Bookmark, BookmarkEntry,
    ClassificationRule, CrawlRun, EmploymentType, JobDetail, JobListItem, JobQuery, MAX_PAGE_SIZE,
    Page, RoleType, SortOption,
};

pub struct AppState {
    pub settings: Arc<Settings>,
}

// ── Errors ────────────────────────────────────────────────────────

/// Error body is always `{"detail": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, detail = %self.detail, "request failed");
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs `f` against a fresh connection on the blocking pool.
async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> crate::error::Result<T> + Send + 'static,
{
    let path = state.settings.database_path.clone();
    tokio::task::spawn_blocking(move || {
        let db = Database::open(&path)?;
        f(&db)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(ApiError::from)
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<u32, ApiError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ApiError::bad_request(format!(
            "{} must be between {} and {}",
            name, min, max
        )))
    }
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct RootResponse {
    service: String,
    env: String,
    health: &'static str,
}

async fn root(State(state): State<Arc<AppState>>) -> Json<RootResponse> {
    Json(RootResponse {
        service: state.settings.app_name.clone(),
        env: state.settings.app_env.clone(),
        health: "/health",
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = match with_db(&state, |db| db.ping()).await {
        Ok(()) => "ok",
        Err(e) => {
            error!(detail = %e.detail, "database health check failed");
            "error"
        }
    };
    Json(HealthResponse {
        status: "ok",
        database,
    })
}

// ── Jobs ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct JobsParams {
    employment_type: Option<String>,
    role_type: Option<String>,
    is_active: Option<bool>,
    q: Option<String>,
    posted_from: Option<DateTime<Utc>>,
    posted_to: Option<DateTime<Utc>>,
    deadline_before: Option<DateTime<Utc>>,
    sort: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl JobsParams {
    fn into_query(self) -> Result<JobQuery, ApiError> {
        let defaults = JobQuery::default();

        let employment_type = non_empty(self.employment_type)
            .map(|v| v.parse::<EmploymentType>())
            .transpose()?;
        // absent means backend; an explicit empty value lists every role
        let role_type = match self.role_type {
            None => defaults.role_type,
            Some(v) => non_empty(Some(v))
                .map(|v| v.parse::<RoleType>())
                .transpose()?,
        };
        let sort = non_empty(self.sort)
            .map(|v| v.parse::<SortOption>())
            .transpose()?
            .unwrap_or(defaults.sort);

        let page = self.page.unwrap_or(defaults.page);
        if page < 1 {
            return Err(ApiError::bad_request("page must be >= 1"));
        }
        let size = check_range("size", self.size.unwrap_or(defaults.size), 1, MAX_PAGE_SIZE)?;

        Ok(JobQuery {
            employment_type,
            role_type,
            is_active: self.is_active.unwrap_or(defaults.is_active),
            q: non_empty(self.q),
            posted_from: self.posted_from,
            posted_to: self.posted_to,
            deadline_before: self.deadline_before,
            sort,
            page,
            size,
        })
    }
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    params: Result<Query<JobsParams>, QueryRejection>,
) -> ApiResult<Page<JobListItem>> {
    let Query(params) = params?;
    let query = params.into_query()?;
    let rule_version = state.settings.rule_version.clone();
    let page = with_db(&state, move |db| db.list_jobs(&query, &rule_version)).await?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
struct TodayParams {
    role_type: Option<String>,
    is_active: Option<bool>,
    page: Option<u32>,
    size: Option<u32>,
}

async fn list_today_jobs(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TodayParams>, QueryRejection>,
) -> ApiResult<Page<JobListItem>> {
    let Query(params) = params?;
    let today_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|start| start.and_utc());
    let query = JobsParams {
        role_type: params.role_type,
        is_active: params.is_active,
        posted_from: today_start,
        page: params.page,
        size: params.size,
        ..JobsParams::default()
    }
    .into_query()?;
    let rule_version = state.settings.rule_version.clone();
    let page = with_db(&state, move |db| db.list_jobs(&query, &rule_version)).await?;
    Ok(Json(page))
}

async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<i64>) -> ApiResult<JobDetail> {
    let rule_version = state.settings.rule_version.clone();
    let detail = with_db(&state, move |db| {
        db.job_detail(job_id, &rule_version)?
            .ok_or_else(|| AppError::not_found("Job not found"))
    })
    .await?;
    Ok(Json(detail))
}

// ── Admin ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CrawlParams {
    source_code: Option<String>,
}

async fn trigger_crawl(
    State(state): State<Arc<AppState>>,
    params: Result<Query<CrawlParams>, QueryRejection>,
) -> ApiResult<CrawlSummary> {
    let Query(params) = params?;
    let source_code = non_empty(params.source_code).unwrap_or_else(|| "remotive".to_string());
    info!(source = %source_code, "crawl requested");
    let summary = with_db(&state, move |db| run_crawl(db, &source_code)).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct ClassifyParams {
    rule_version: Option<String>,
    limit: Option<u32>,
}

async fn trigger_classification(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ClassifyParams>, QueryRejection>,
) -> ApiResult<ClassifySummary> {
    let Query(params) = params?;
    let rule_version =
        non_empty(params.rule_version).unwrap_or_else(|| state.settings.rule_version.clone());
    let limit = check_range("limit", params.limit.unwrap_or(200), 1, 1000)?;
    let summary = with_db(&state, move |db| classify_jobs(db, &rule_version, limit as usize)).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct RunsResponse {
    items: Vec<CrawlRun>,
    limit: u32,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RunsParams>, QueryRejection>,
) -> ApiResult<RunsResponse> {
    let Query(params) = params?;
    let limit = check_range("limit", params.limit.unwrap_or(20), 1, 100)?;
    let items = with_db(&state, move |db| db.list_runs(limit as usize)).await?;
    Ok(Json(RunsResponse { items, limit }))
}

#[derive(Debug, Deserialize)]
struct RulesParams {
    rule_version: Option<String>,
}

#[derive(Serialize)]
struct RulesResponse {
    rule_version: String,
    items: Vec<ClassificationRule>,
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RulesParams>, QueryRejection>,
) -> ApiResult<RulesResponse> {
    let Query(params) = params?;
    let rule_version =
        non_empty(params.rule_version).unwrap_or_else(|| state.settings.rule_version.clone());
    let version = rule_version.clone();
    let items = with_db(&state, move |db| db.list_rules(&version, false)).await?;
    Ok(Json(RulesResponse { rule_version, items }))
}

// ── Bookmarks & applications ──────────────────────────────────────

#[derive(Serialize)]
struct ListResponse<T> {
    items: Vec<T>,
    total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Deserialize)]
struct BookmarkRequest {
    job_id: i64,
    memo: Option<String>,
}

async fn create_bookmark(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BookmarkRequest>, JsonRejection>,
) -> ApiResult<Bookmark> {
    let Json(payload) = payload?;
    let bookmark = with_db(&state, move |db| {
        db.upsert_bookmark(payload.job_id, payload.memo.as_deref())
    })
    .await?;
    Ok(Json(bookmark))
}

async fn list_bookmarks(State(state): State<Arc<AppState>>) -> ApiResult<ListResponse<BookmarkEntry>> {
    let items = with_db(&state, |db| db.list_bookmarks()).await?;
    Ok(Json(items.into()))
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: bool,
    job_id: i64,
}

async fn delete_bookmark(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> ApiResult<DeletedResponse> {
    with_db(&state, move |db| {
        if db.delete_bookmark(job_id)? {
            Ok(())
        } else {
            Err(AppError::not_found("Bookmark not found"))
        }
    })
    .await?;
    Ok(Json(DeletedResponse {
        deleted: true,
        job_id,
    }))
}

#[derive(Debug, Deserialize)]
struct ApplicationRequest {
    status: ApplicationStatus,
    applied_at: Option<DateTime<Utc>>,
    note: Option<String>,
}

async fn upsert_application(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
    payload: Result<Json<ApplicationRequest>, JsonRejection>,
) -> ApiResult<Application> {
    let Json(payload) = payload?;
    let application = with_db(&state, move |db| {
        db.upsert_application(job_id, payload.status, payload.applied_at, payload.note.as_deref())
    })
    .await?;
    Ok(Json(application))
}

async fn list_applications(
    State(state): State<Arc<AppState>>,
) -> ApiResult<ListResponse<ApplicationEntry>> {
    let items = with_db(&state, |db| db.list_applications()).await?;
    Ok(Json(items.into()))
}

// ── Router ────────────────────────────────────────────────────────

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn router(settings: Arc<Settings>) -> Router {
    let cors = cors_layer(&settings.cors_origins);
    let state = Arc::new(AppState { settings });

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/today", get(list_today_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/admin/crawl/run", post(trigger_crawl))
        .route("/admin/classify/run", post(trigger_classification))
        .route("/admin/runs", get(list_runs))
        .route("/admin/rules", get(list_rules))
        .route("/bookmarks", post(create_bookmark).get(list_bookmarks))
        .route("/bookmarks/{job_id}", delete(delete_bookmark))
        .route("/applications", get(list_applications))
        .route("/applications/{job_id}", put(upsert_application))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds and serves until ctrl-c.
pub async fn serve(settings: Arc<Settings>) -> anyhow::Result<()> {
    let addr = settings.bind_addr();
    let app = router(settings);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}
