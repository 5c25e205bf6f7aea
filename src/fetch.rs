use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::FetchError;

/// One fetched document, static or browser-rendered.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub html: String,
    pub rendered: bool,
}

/// Fetch one page, asynchronously, with retry/backoff and duplicate suppression.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, render: bool) -> Result<Page, FetchError>;
}

/// reqwest for static HTML, spider.cloud Chrome rendering for the DOM fallback.
pub struct HttpFetcher {
    client: reqwest::Client,
    spider: Option<Spider>,
    permits: Semaphore,
    seen: Mutex<HashSet<(String, bool)>>,
    max_retries: u32,
    backoff_ms: u64,
    delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &RunConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let spider = match std::env::var("SPIDER_API_KEY") {
            Ok(key) if !key.is_empty() => Some(
                Spider::new(Some(key))
                    .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?,
            ),
            _ => None,
        };

        Ok(HttpFetcher {
            client,
            spider,
            permits: Semaphore::new(config.concurrency),
            seen: Mutex::new(HashSet::new()),
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            delay: Duration::from_millis(config.download_delay_ms),
        })
    }

    pub fn can_render(&self) -> bool {
        self.spider.is_some()
    }

    fn claim(&self, url: &str, render: bool) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert((url.to_string(), render)),
            Err(poisoned) => poisoned.into_inner().insert((url.to_string(), render)),
        }
    }

    async fn attempt(&self, url: &str, render: bool) -> Result<Page, FetchError> {
        if render {
            self.render_once(url).await
        } else {
            self.get_once(url).await
        }
    }

    async fn get_once(&self, url: &str) -> Result<Page, FetchError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en")
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Page {
            url: final_url,
            html,
            rendered: false,
        })
    }

    async fn render_once(&self, url: &str) -> Result<Page, FetchError> {
        let spider = self
            .spider
            .as_ref()
            .ok_or_else(|| FetchError::Unavailable("SPIDER_API_KEY is not set".into()))?;

        let params = RequestParams {
            request: Some(RequestType::Chrome),
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let value = spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Render {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let parsed: serde_json::Value = match value.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
            None => value,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        if let Some(status) = first.and_then(|o| o.get("status")).and_then(|s| s.as_i64()) {
            if !(200..300).contains(&status) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status as u16,
                });
            }
        }

        let html = first
            .and_then(|o| o.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| FetchError::Render {
                url: url.to_string(),
                message: "no content in spider response".into(),
            })?;

        Ok(Page {
            url: url.to_string(),
            html: html.to_string(),
            rendered: true,
        })
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff from `base_ms`, capped at a minute.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let ms = 2u64
        .checked_pow(attempt)
        .and_then(|m| base_ms.checked_mul(m))
        .unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

fn should_retry(err: &FetchError) -> bool {
    match err {
        FetchError::Status { status, .. } => *status == 429 || *status >= 500,
        FetchError::Transport { .. } | FetchError::Render { .. } => true,
        FetchError::Unavailable(_) | FetchError::Duplicate(_) => false,
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, render: bool) -> Result<Page, FetchError> {
        if !self.claim(url, render) {
            return Err(FetchError::Duplicate(url.to_string()));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Unavailable("fetch pool closed".into()))?;

        let mut attempt = 0;
        loop {
            let start = Instant::now();
            let result = self.attempt(url, render).await;
            debug!(url, render, attempt, ms = start.elapsed().as_millis() as u64, "fetch");

            match result {
                Ok(page) => {
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    return Ok(page);
                }
                Err(e) if should_retry(&e) && attempt < self.max_retries => {
                    let wait = backoff(self.backoff_ms, attempt);
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt + 1,
                        self.max_retries,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
