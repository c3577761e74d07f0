use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Endpoint and credentials, read once and handed to the client.
#[derive(Debug, Clone)]
pub struct WikiConfig {
    pub base_url: String,
    pub user: String,
    pub api_token: String,
    pub timeout: Duration,
}

impl WikiConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = require_env("CONFLUENCE_BASE_URL")?;
        let user = require_env("CONFLUENCE_USER")?;
        let api_token = require_env("CONFLUENCE_API_TOKEN")?;
        let timeout_secs = match std::env::var("CONFLUENCE_TIMEOUT_SECS") {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("CONFLUENCE_TIMEOUT_SECS is not a number: {}", s))?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };
        Ok(Self::new(&base_url, &user, &api_token, Duration::from_secs(timeout_secs)))
    }

    pub fn new(base_url: &str, user: &str, api_token: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            user: user.to_string(),
            api_token: api_token.to_string(),
            timeout,
        }
    }

    pub fn content_url(&self, page_id: &str) -> String {
        format!("{}/rest/api/content/{}", self.base_url, page_id)
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable must be set", key))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub body: String,
}

#[derive(Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    version: VersionInfo,
    body: BodyInfo,
}

#[derive(Deserialize)]
struct VersionInfo {
    number: u64,
}

#[derive(Deserialize)]
struct BodyInfo {
    storage: StorageInfo,
}

#[derive(Deserialize)]
struct StorageInfo {
    value: String,
}

pub fn parse_page(json: &str) -> Result<Page> {
    let content: ContentResponse = serde_json::from_str(json)?;
    Ok(Page {
        id: content.id,
        title: content.title,
        version: content.version.number,
        body: content.body.storage.value,
    })
}

#[derive(Deserialize)]
struct UpdateResponse {
    version: VersionInfo,
}

/// Version number Confluence stored, from the PUT response.
pub fn parse_stored_version(json: &str) -> Result<u64> {
    let resp: UpdateResponse = serde_json::from_str(json)?;
    Ok(resp.version.number)
}

/// PUT body for a new page version; Confluence wants `current + 1`.
pub fn update_payload(page: &Page, body: &str) -> serde_json::Value {
    serde_json::json!({
        "id": page.id,
        "type": "page",
        "title": page.title,
        "version": { "number": page.version + 1 },
        "body": {
            "storage": {
                "value": body,
                "representation": "storage",
            }
        }
    })
}

pub struct ConfluenceClient {
    http: Client,
    config: WikiConfig,
}

impl ConfluenceClient {
    pub fn new(config: WikiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, config })
    }

    pub async fn fetch_page(&self, page_id: &str) -> Result<Page> {
        let url = format!("{}?expand=body.storage,version", self.config.content_url(page_id));
        let text = self.send_with_retry(page_id, || self.http.get(&url)).await?;
        let page = parse_page(&text)
            .with_context(|| format!("Unexpected content payload for page {}", page_id))?;
        debug!("Fetched page {} '{}' at version {}", page.id, page.title, page.version);
        Ok(page)
    }

    /// Write `body` as the next version of `page`. No retry on version
    /// conflicts: two writers on one page must be serialized outside.
    pub async fn update_page(&self, page: &Page, body: &str) -> Result<u64> {
        let url = self.config.content_url(&page.id);
        let payload = serde_json::to_vec(&update_payload(page, body))?;
        let text = self
            .send_with_retry(&page.id, || {
                self.http
                    .put(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(payload.clone())
            })
            .await?;
        let stored = parse_stored_version(&text)
            .with_context(|| format!("Unexpected update response for page {}", page.id))?;
        if stored != page.version + 1 {
            warn!(
                "Page {} stored as version {}, expected {}",
                page.id,
                stored,
                page.version + 1
            );
        }
        Ok(stored)
    }

    async fn send_with_retry(
        &self,
        page_id: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<String> {
        let mut attempt = 0;
        loop {
            let response = build()
                .basic_auth(&self.config.user, Some(&self.config.api_token))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().await.context("Failed to read Confluence response");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status == StatusCode::CONFLICT {
                        bail!(
                            "Version conflict on page {}: it changed during this run ({})",
                            page_id,
                            snippet(&body)
                        );
                    }
                    if !is_retryable(status) || attempt == MAX_RETRIES {
                        bail!("Confluence returned {} for page {}: {}", status, page_id, snippet(&body));
                    }
                    warn!(
                        "Confluence returned {} for page {} (attempt {}/{}), backing off {:.1}s",
                        status,
                        page_id,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff(attempt).as_secs_f64()
                    );
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < MAX_RETRIES => {
                    warn!(
                        "Request for page {} failed (attempt {}/{}): {}, backing off {:.1}s",
                        page_id,
                        attempt + 1,
                        MAX_RETRIES,
                        e,
                        backoff(attempt).as_secs_f64()
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Request for page {} failed", page_id));
                }
            }

            tokio::time::sleep(backoff(attempt)).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(200).collect::<String>())
    }
}
