use serde_json::Value;
use url::Url;
use tracing::info;

use crate::connector::{CrawlJob, JobSource, join_tags, parse_timestamp, str_field};
use crate::error::Result;
use crate::http::JsonFetcher;

pub const REMOTIVE_ENDPOINT: &str = "https://remotive.com/api/remote-jobs?search=backend";

/// Remotive public API (`{"jobs": [...]}`).
#[derive(Debug, Clone)]
pub struct RemotiveConnector {
    endpoint: String,
    fetcher: JsonFetcher,
}

impl RemotiveConnector {
    pub fn new(fetcher: JsonFetcher) -> Self {
        Self {
            endpoint: REMOTIVE_ENDPOINT.to_string(),
            fetcher,
        }
    }
}

impl JobSource for RemotiveConnector {
    fn source_code(&self) -> &str {
        "remotive"
    }

    fn fetch_jobs(&self) -> Result<Vec<CrawlJob>> {
        let payload = self.fetcher.fetch_json(&self.endpoint)?;
        let jobs = parse_payload(&payload);
        info!(source = "remotive", count = jobs.len(), "normalized postings");
        Ok(jobs)
    }
}

pub fn parse_payload(payload: &Value) -> Vec<CrawlJob> {
    let Some(items) = payload.get("jobs").and_then(Value::as_array) else {
        return Vec::new();
    };

    items.iter().filter_map(parse_item).collect()
}

fn parse_item(item: &Value) -> Option<CrawlJob> {
    let url = str_field(item, "url")?;

    let source_job_id = str_field(item, "id").unwrap_or_else(|| url_path(&url));
    let company = str_field(item, "company_name").unwrap_or_else(|| "Unknown".to_string());
    let title = str_field(item, "title").unwrap_or_else(|| "Untitled".to_string());

    let tags: Vec<String> = item
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut job = CrawlJob::new(&source_job_id, &url, &company, &title);
    job.description_text = str_field(item, "description");
    job.location_text = str_field(item, "candidate_required_location");
    job.employment_text_raw = str_field(item, "job_type");
    job.tech_stack_text = join_tags(tags);
    job.salary_text = str_field(item, "salary");
    job.posted_at = parse_timestamp(item.get("publication_date").and_then(Value::as_str));
    Some(job)
}

/// Path component of an absolute URL, e.g. `/remote-jobs/backend-123`.
/// Unparseable URLs are used whole.
fn url_path(raw: &str) -> String {
    Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payload_normalizes_fields() {
        let payload = json!({
            "jobs": [
                {
                    "id": 123,
                    "url": "https://remotive.com/remote-jobs/software-dev/backend-engineer-123",
                    "company_name": "Acme",
                    "title": "Backend Engineer",
                    "description": "Python FastAPI",
                    "candidate_required_location": "Korea",
                    "job_type": "full_time",
                    "tags": ["python", "fastapi"],
                    "salary": "$100k",
                    "publication_date": "2026-02-17T00:00:00+00:00"
                }
            ]
        });

        let jobs = parse_payload(&payload);
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.source_job_id, "123");
        assert_eq!(job.company_name, "Acme");
        assert_eq!(job.employment_text_raw.as_deref(), Some("full_time"));
        assert_eq!(job.tech_stack_text.as_deref(), Some("python, fastapi"));
        assert_eq!(job.location_text.as_deref(), Some("Korea"));
        assert!(job.posted_at.is_some());
    }

    #[test]
    fn test_parse_payload_skips_items_without_url() {
        let payload = json!({
            "jobs": [
                {"id": 1, "title": "No link"},
                {"id": 2, "url": "https://remotive.com/remote-jobs/dev/two", "title": "Two"}
            ]
        });
        let jobs = parse_payload(&payload);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_job_id, "2");
    }

    #[test]
    fn test_parse_payload_defaults_and_fallback_id() {
        let payload = json!({
            "jobs": [
                {
                    "url": "https://remotive.com/remote-jobs/dev/backend-999?ref=feed",
                    "publication_date": "not a date",
                    "tags": []
                }
            ]
        });
        let jobs = parse_payload(&payload);
        let job = &jobs[0];
        assert_eq!(job.source_job_id, "/remote-jobs/dev/backend-999");
        assert_eq!(job.company_name, "Unknown");
        assert_eq!(job.title, "Untitled");
        assert_eq!(job.tech_stack_text, None);
        assert_eq!(job.posted_at, None);
    }

    #[test]
    fn test_parse_payload_without_jobs_key() {
        assert!(parse_payload(&json!({})).is_empty());
        assert!(parse_payload(&json!({"jobs": null})).is_empty());
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("https://a.test/x/y?q=1#f"), "/x/y");
        assert_eq!(url_path("https://a.test"), "/");
        assert_eq!(url_path("not a url"), "not a url");
    }

    #[test]
    fn test_slash_in_query_is_not_the_path() {
        assert_eq!(url_path("https://remotive.com?ref=/remote-jobs/5"), "/");

        let payload = json!({"jobs": [
            {"url": "https://remotive.com?ref=/remote-jobs/5", "title": "A"},
            {"url": "https://remotive.com/remote-jobs/5", "title": "B"}
        ]});
        let jobs = parse_payload(&payload);
        assert_eq!(jobs.len(), 2);
        assert_ne!(jobs[0].source_job_id, jobs[1].source_job_id);
        assert_eq!(jobs[1].source_job_id, "/remote-jobs/5");
    }

    #[test]
    #[ignore] // hits the live Remotive API
    fn test_live_fetch() {
        let connector = RemotiveConnector::new(JsonFetcher::with_defaults().unwrap());
        let jobs = connector.fetch_jobs().unwrap();
        assert!(jobs.iter().all(|j| !j.canonical_url.is_empty()));
    }
}
