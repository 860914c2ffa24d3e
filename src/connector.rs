use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::greenhouse::GreenhouseConnector;
use crate::http::JsonFetcher;
use crate::remotive::RemotiveConnector;

/// A posting normalized from any upstream API.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlJob {
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
}

impl CrawlJob {
    pub fn new(source_job_id: &str, canonical_url: &str, company_name: &str, title: &str) -> Self {
        Self {
            source_job_id: source_job_id.to_string(),
            canonical_url: canonical_url.to_string(),
            company_name: company_name.to_string(),
            title: title.to_string(),
            description_text: None,
            location_text: None,
            employment_text_raw: None,
            experience_text_raw: None,
            tech_stack_text: None,
            salary_text: None,
            posted_at: None,
            deadline_at: None,
        }
    }
}

/// Anything the ingestion runner can pull postings from.
pub trait JobSource {
    fn source_code(&self) -> &str;
    fn fetch_jobs(&self) -> Result<Vec<CrawlJob>>;
}

const GREENHOUSE_BOARDS: &[(&str, &str, &str)] = &[
    ("moloco_gh", "moloco", "Moloco"),
    ("sendbird_gh", "sendbird", "Sendbird"),
    ("dunamu_gh", "dunamu", "Dunamu"),
];

/// Closed registry of upstream connectors, keyed by source code.
#[derive(Debug, Clone)]
pub enum SourceConnector {
    Remotive(RemotiveConnector),
    Greenhouse(GreenhouseConnector),
}

impl SourceConnector {
    pub fn for_source(source_code: &str) -> Result<Self> {
        let fetcher = JsonFetcher::with_defaults()?;
        Self::for_source_with(source_code, fetcher)
    }

    pub fn for_source_with(source_code: &str, fetcher: JsonFetcher) -> Result<Self> {
        let code = source_code.trim().to_lowercase();
        if code == "remotive" {
            return Ok(SourceConnector::Remotive(RemotiveConnector::new(fetcher)));
        }

        GREENHOUSE_BOARDS
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(c, board, company)| {
                SourceConnector::Greenhouse(GreenhouseConnector::new(c, board, company, fetcher))
            })
            .ok_or_else(|| AppError::not_found(format!("Unsupported source_code: {}", code)))
    }

    pub fn registered_codes() -> Vec<&'static str> {
        let mut codes = vec!["remotive"];
        codes.extend(GREENHOUSE_BOARDS.iter().map(|(c, _, _)| *c));
        codes
    }
}

impl JobSource for SourceConnector {
    fn source_code(&self) -> &str {
        match self {
            SourceConnector::Remotive(c) => c.source_code(),
            SourceConnector::Greenhouse(c) => c.source_code(),
        }
    }

    fn fetch_jobs(&self) -> Result<Vec<CrawlJob>> {
        match self {
            SourceConnector::Remotive(c) => c.fetch_jobs(),
            SourceConnector::Greenhouse(c) => c.fetch_jobs(),
        }
    }
}

// --- Helpers shared by the connectors ---

/// Parse a provider timestamp. Malformed or missing values become `None`.
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive timestamps are taken as UTC
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Non-empty string field, or a number rendered as a string.
pub(crate) fn str_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn join_tags(tags: Vec<String>) -> Option<String> {
    if tags.is_empty() {
        None
    } else {
        Some(tags.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_registry_resolves_known_codes() {
        let remotive = SourceConnector::for_source("remotive").unwrap();
        assert!(matches!(remotive, SourceConnector::Remotive(_)));
        assert_eq!(remotive.source_code(), "remotive");

        let moloco = SourceConnector::for_source(" MOLOCO_GH ").unwrap();
        assert!(matches!(moloco, SourceConnector::Greenhouse(_)));
        assert_eq!(moloco.source_code(), "moloco_gh");
    }

    #[test]
    fn test_registry_rejects_unknown_code() {
        let err = SourceConnector::for_source("unknown_source").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_registered_codes() {
        let codes = SourceConnector::registered_codes();
        assert_eq!(codes, vec!["remotive", "moloco_gh", "sendbird_gh", "dunamu_gh"]);
        for code in codes {
            assert!(SourceConnector::for_source(code).is_ok());
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some("2026-02-17T00:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(Some("2026-02-17T09:00:00+09:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("2026-02-17T00:00:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("2026-02-17")), Some(expected));
        assert!(parse_timestamp(Some("2026-02-17T00:00:00.250")).is_some());
    }

    #[test]
    fn test_parse_timestamp_never_fails() {
        assert_eq!(parse_timestamp(None), None);
        assert_eq!(parse_timestamp(Some("")), None);
        assert_eq!(parse_timestamp(Some("yesterday")), None);
        assert_eq!(parse_timestamp(Some("2026-13-45T99:00:00Z")), None);
    }

    #[test]
    fn test_str_field_accepts_numbers() {
        let item = json!({"id": 123, "name": "x", "blank": "  ", "flag": true});
        assert_eq!(str_field(&item, "id"), Some("123".to_string()));
        assert_eq!(str_field(&item, "name"), Some("x".to_string()));
        assert_eq!(str_field(&item, "blank"), None);
        assert_eq!(str_field(&item, "flag"), None);
        assert_eq!(str_field(&item, "missing"), None);
    }
}
