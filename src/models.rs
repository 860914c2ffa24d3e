use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Declares a closed enum stored as TEXT and serialized by its snake_case name.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident ($label:literal) { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::validation(format!(
                        "invalid {} '{}' (expected one of: {})",
                        $label,
                        other,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    EmploymentType ("employment_type") {
        InternExperience => "intern_experience",
        InternConvertible => "intern_convertible",
        NewGrad => "new_grad",
        Experienced => "experienced",
        Unknown => "unknown",
    }
}

text_enum! {
    RoleType ("role_type") {
        Backend => "backend",
        Frontend => "frontend",
        Fullstack => "fullstack",
        Data => "data",
        Mobile => "mobile",
        Devops => "devops",
        Unknown => "unknown",
    }
}

text_enum! {
    /// `PartialFail` is reserved; the runner only ever writes the other three.
    RunStatus ("run status") {
        Running => "running",
        Success => "success",
        PartialFail => "partial_fail",
        Failed => "failed",
    }
}

text_enum! {
    ApplicationStatus ("application status") {
        Planned => "planned",
        Applied => "applied",
        Interview => "interview",
        Rejected => "rejected",
        Pass => "pass",
    }
}

text_enum! {
    SortOption ("sort") {
        PostedAtDesc => "posted_at_desc",
        DeadlineAsc => "deadline_asc",
        ScoreDesc => "score_desc",
    }
}

impl Default for SortOption {
    fn default() -> Self {
        SortOption::PostedAtDesc
    }
}

/// How a rule keyword is compared against the text blob.
///
/// `Regex` is accepted in the rule table but evaluated as a substring match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
        }
    }

    /// Anything that is not `exact` or `regex` is a substring match.
    pub fn from_db(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "exact" => MatchType::Exact,
            "regex" => MatchType::Regex,
            _ => MatchType::Contains,
        }
    }
}

impl ToSql for MatchType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MatchType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(MatchType::from_db(value.as_str()?))
    }
}

/// Rule categories the engine consumes. Other category strings may exist in
/// the rule table; they are loaded and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Employment,
    Role,
    Exclude,
    Score,
}

impl RuleCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "employment" => Some(RuleCategory::Employment),
            "role" => Some(RuleCategory::Role),
            "exclude" => Some(RuleCategory::Exclude),
            "score" => Some(RuleCategory::Score),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Employment => "employment",
            RuleCategory::Role => "role",
            RuleCategory::Exclude => "exclude",
            RuleCategory::Score => "score",
        }
    }
}

// --- Stored rows ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub base_url: String,
    pub is_active: bool,
    pub crawl_interval_min: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub source_id: i64,
    pub source_job_id: String,
    pub canonical_url: String,
    pub company_name: String,
    pub title: String,
    pub description_text: Option<String>,
    pub location_text: Option<String>,
    pub employment_text_raw: Option<String>,
    pub experience_text_raw: Option<String>,
    pub tech_stack_text: Option<String>,
    pub salary_text: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: i64,
    pub rule_version: String,
    pub category: String,
    pub target_value: String,
    pub keyword: String,
    pub match_type: MatchType,
    /// Lower number wins.
    pub priority: i32,
    /// Signed score contribution; only read for `score` rules.
    pub weight: i32,
    /// Stored but not consulted by the engine.
    pub is_negation: bool,
    pub is_active: bool,
}

/// Insert payload for the rule table.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub rule_version: String,
    pub category: String,
    pub target_value: String,
    pub keyword: String,
    pub match_type: MatchType,
    pub priority: i32,
    pub weight: i32,
    pub is_negation: bool,
    pub is_active: bool,
}

impl NewRule {
    pub fn new(rule_version: &str, category: &str, target_value: &str, keyword: &str) -> Self {
        Self {
            rule_version: rule_version.to_string(),
            category: category.to_string(),
            target_value: target_value.to_string(),
            keyword: keyword.to_string(),
            match_type: MatchType::Contains,
            priority: 100,
            weight: 0,
            is_negation: false,
            is_active: true,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// One rule hit, kept on the classification for traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedKeyword {
    pub category: String,
    pub target_value: String,
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClassification {
    pub id: i64,
    pub job_id: i64,
    pub rule_version: String,
    pub employment_type: EmploymentType,
    pub role_type: RoleType,
    pub new_grad_score: i32,
    pub confidence: f64,
    pub matched_keywords: Vec<MatchedKeyword>,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: i64,
    pub source_id: Option<i64>,
    pub source_code: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    pub error_message: Option<String>,
}

/// Final counters written onto a crawl run when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: i64,
    pub job_id: i64,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub job_id: i64,
    pub status: ApplicationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Job title/company/url denormalized onto bookmark and application listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRef {
    pub title: String,
    pub company_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarkEntry {
    #[serde(flatten)]
    pub bookmark: Bookmark,
    #[serde(flatten)]
    pub job: JobRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEntry {
    #[serde(flatten)]
    pub application: Application,
    #[serde(flatten)]
    pub job: JobRef,
}

// --- Query layer ---

#[derive(Debug, Clone)]
pub struct JobQuery {
    pub employment_type: Option<EmploymentType>,
    pub role_type: Option<RoleType>,
    pub is_active: bool,
    pub q: Option<String>,
    pub posted_from: Option<DateTime<Utc>>,
    pub posted_to: Option<DateTime<Utc>>,
    pub deadline_before: Option<DateTime<Utc>>,
    pub sort: SortOption,
    pub page: u32,
    pub size: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            employment_type: None,
            role_type: Some(RoleType::Backend),
            is_active: true,
            q: None,
            posted_from: None,
            posted_to: None,
            deadline_before: None,
            sort: SortOption::default(),
            page: 1,
            size: 20,
        }
    }
}

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListItem {
    pub job_id: i64,
    pub title: String,
    pub company_name: String,
    pub url: String,
    pub employment_type: EmploymentType,
    pub role_type: RoleType,
    pub new_grad_score: i32,
    pub posted_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job_id: i64,
    pub title: String,
    pub company_name: String,
    pub url: String,
    pub description_text: Option<String>,
    pub location_text: Option<String>,
    pub employment_text_raw: Option<String>,
    pub experience_text_raw: Option<String>,
    pub tech_stack_text: Option<String>,
    pub salary_text: Option<String>,
    pub employment_type: EmploymentType,
    pub role_type: RoleType,
    pub new_grad_score: i32,
    pub confidence: f64,
    pub matched_keywords: Vec<MatchedKeyword>,
    pub reasoning: Option<String>,
    pub rule_version: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trip_names() {
        for t in EmploymentType::ALL {
            assert_eq!(t.as_str().parse::<EmploymentType>().unwrap(), *t);
        }
        assert_eq!("backend".parse::<RoleType>().unwrap(), RoleType::Backend);
        assert!("architect".parse::<RoleType>().is_err());
    }

    #[test]
    fn test_text_enum_rejects_unknown_with_validation_error() {
        let err = "hired".parse::<ApplicationStatus>().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("planned"));
    }

    #[test]
    fn test_match_type_from_db_is_lossy() {
        assert_eq!(MatchType::from_db("exact"), MatchType::Exact);
        assert_eq!(MatchType::from_db("EXACT"), MatchType::Exact);
        assert_eq!(MatchType::from_db("regex"), MatchType::Regex);
        assert_eq!(MatchType::from_db("contains"), MatchType::Contains);
        assert_eq!(MatchType::from_db("fuzzy"), MatchType::Contains);
    }

    #[test]
    fn test_rule_category_parse() {
        assert_eq!(RuleCategory::parse("exclude"), Some(RuleCategory::Exclude));
        assert_eq!(RuleCategory::parse("location"), None);
    }

    #[test]
    fn test_matched_keyword_serializes_priority_or_weight() {
        let hit = MatchedKeyword {
            category: "score".to_string(),
            target_value: "new_grad".to_string(),
            keyword: "entry level".to_string(),
            priority: None,
            weight: Some(20),
        };
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["weight"], 20);
        assert!(json.get("priority").is_none());
    }

    #[test]
    fn test_sort_option_serde_names() {
        let sort: SortOption = serde_json::from_str("\"score_desc\"").unwrap();
        assert_eq!(sort, SortOption::ScoreDesc);
        assert_eq!(SortOption::default(), SortOption::PostedAtDesc);
    }
}
