use serde_json::Value;
use tracing::info;

use crate::connector::{CrawlJob, JobSource, join_tags, parse_timestamp, str_field};
use crate::error::Result;
use crate::http::JsonFetcher;

/// Greenhouse job board API, one board token per company.
#[derive(Debug, Clone)]
pub struct GreenhouseConnector {
    source_code: String,
    board_token: String,
    company_name: String,
    fetcher: JsonFetcher,
}

impl GreenhouseConnector {
    pub fn new(source_code: &str, board_token: &str, company_name: &str, fetcher: JsonFetcher) -> Self {
        Self {
            source_code: source_code.to_string(),
            board_token: board_token.to_string(),
            company_name: company_name.to_string(),
            fetcher,
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "https://boards-api.greenhouse.io/v1/boards/{}/jobs?content=true",
            self.board_token
        )
    }
}

impl JobSource for GreenhouseConnector {
    fn source_code(&self) -> &str {
        &self.source_code
    }

    fn fetch_jobs(&self) -> Result<Vec<CrawlJob>> {
        let payload = self.fetcher.fetch_json(&self.endpoint())?;
        let jobs = parse_payload(&payload, &self.company_name);
        info!(source = %self.source_code, count = jobs.len(), "normalized postings");
        Ok(jobs)
    }
}

pub fn parse_payload(payload: &Value, company_name: &str) -> Vec<CrawlJob> {
    let Some(items) = payload.get("jobs").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| parse_item(item, company_name))
        .collect()
}

fn parse_item(item: &Value, company_name: &str) -> Option<CrawlJob> {
    let job_id = str_field(item, "id")?;
    let absolute_url = str_field(item, "absolute_url")?;
    let title = str_field(item, "title")?;

    let mut tags = names(item.get("departments"));
    tags.extend(names(item.get("offices")));
    if let Some(metadata) = item.get("metadata").and_then(Value::as_array) {
        for meta in metadata {
            let name = meta.get("name").and_then(Value::as_str).filter(|s| !s.is_empty());
            let value = meta_value(meta.get("value"));
            if let (Some(name), Some(value)) = (name, value) {
                tags.push(format!("{}:{}", name, value));
            }
        }
    }

    let mut job = CrawlJob::new(&job_id, &absolute_url, company_name, &title);
    job.description_text = Some(str_field(item, "content").unwrap_or_default());
    job.location_text = item
        .get("location")
        .and_then(|loc| loc.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    job.tech_stack_text = join_tags(tags);
    job.posted_at = parse_timestamp(item.get("updated_at").and_then(Value::as_str));
    Some(job)
}

fn names(list: Option<&Value>) -> Vec<String> {
    list.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("name").and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// Metadata values are strings, numbers, or lists of strings
fn meta_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(values) => {
            let joined: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("/"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "jobs": [
                {
                    "id": 77,
                    "absolute_url": "https://boards.greenhouse.io/moloco/jobs/77",
                    "title": "Backend Platform Engineer",
                    "content": "Build services",
                    "updated_at": "2026-02-17T00:00:00Z",
                    "location": {"name": "Seoul"},
                    "departments": [{"name": "Engineering"}],
                    "offices": [{"name": "Korea"}],
                    "metadata": [{"name": "employment_type", "value": "Full-time"}]
                }
            ]
        })
    }

    #[test]
    fn test_parse_payload_normalizes_fields() {
        let jobs = parse_payload(&sample_payload(), "Moloco");
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.source_job_id, "77");
        assert_eq!(job.company_name, "Moloco");
        assert_eq!(job.location_text.as_deref(), Some("Seoul"));
        assert_eq!(job.description_text.as_deref(), Some("Build services"));
        assert_eq!(
            job.tech_stack_text.as_deref(),
            Some("Engineering, Korea, employment_type:Full-time")
        );
        assert!(job.posted_at.is_some());
    }

    #[test]
    fn test_parse_payload_skips_incomplete_items() {
        let payload = json!({
            "jobs": [
                {"absolute_url": "https://x.test/1", "title": "No id"},
                {"id": 2, "title": "No url"},
                {"id": 3, "absolute_url": "https://x.test/3"},
                {"id": 4, "absolute_url": "https://x.test/4", "title": "Complete"}
            ]
        });
        let jobs = parse_payload(&payload, "Sendbird");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_job_id, "4");
        assert_eq!(jobs[0].tech_stack_text, None);
        assert_eq!(jobs[0].location_text, None);
    }

    #[test]
    fn test_metadata_without_value_is_dropped() {
        let payload = json!({
            "jobs": [{
                "id": 5,
                "absolute_url": "https://x.test/5",
                "title": "Data Engineer",
                "metadata": [
                    {"name": "team", "value": null},
                    {"name": "level", "value": ["Junior", "Mid"]}
                ]
            }]
        });
        let jobs = parse_payload(&payload, "Dunamu");
        assert_eq!(jobs[0].tech_stack_text.as_deref(), Some("level:Junior/Mid"));
    }

    #[test]
    fn test_endpoint_uses_board_token() {
        let fetcher = JsonFetcher::with_defaults().unwrap();
        let connector = GreenhouseConnector::new("moloco_gh", "moloco", "Moloco", fetcher);
        assert_eq!(
            connector.endpoint(),
            "https://boards-api.greenhouse.io/v1/boards/moloco/jobs?content=true"
        );
    }

    #[test]
    #[ignore] // hits the live Greenhouse board API
    fn test_live_fetch() {
        let fetcher = JsonFetcher::with_defaults().unwrap();
        let connector = GreenhouseConnector::new("sendbird_gh", "sendbird", "Sendbird", fetcher);
        let jobs = connector.fetch_jobs().unwrap();
        assert!(jobs.iter().all(|j| j.company_name == "Sendbird"));
    }
}
