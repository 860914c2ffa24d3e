use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

const USER_AGENT: &str = "JobLogCrawler/1.0 (+https://joblog.local)";
const ACCEPT: &str = "application/json,text/plain,*/*";

/// Bounded retry with linearly increasing backoff: the n-th retry waits
/// `backoff * n`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

#[derive(Debug, Clone)]
pub struct JsonFetcher {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
}

impl JsonFetcher {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, retry })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Duration::from_secs(15), RetryPolicy::default())
    }

    /// GET `url` and decode the body as JSON, retrying on any failure.
    pub fn fetch_json(&self, url: &str) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 0..=self.retry.retries {
            match self.fetch_once(url) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(url, attempt = attempt + 1, error = %e, "fetch attempt failed");
                    last_error = e.to_string();
                    if attempt < self.retry.retries {
                        let delay = self.retry.delay_for(attempt);
                        debug!(url, ?delay, "backing off before retry");
                        thread::sleep(delay);
                    }
                }
            }
        }

        Err(AppError::fetch(url, last_error))
    }

    fn fetch_once(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()?
            .error_for_status()?;
        Ok(response.json::<Value>()?)
    }
}
