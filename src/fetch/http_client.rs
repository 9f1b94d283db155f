use super::{FetchWorker, WorkItem};
use crate::config::FetchConfig;
use crate::error::BatchError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Downloads the page straight into the artifact file.
pub struct HttpWorker {
    inner: reqwest::Client,
    url_template: String,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl HttpWorker {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        // Validate the template once with placeholder values.
        expand(&config.url_template, "Page", "0000")?;

        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            url_template: config.url_template.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    /// Fetch a URL as bytes with retry on rate limiting and transport errors.
    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let mut last_err = anyhow!("No attempts made");

        for attempt in 1..=self.max_retries.saturating_add(1) {
            debug!("GET {} (attempt {})", url, attempt);

            match self.inner.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.context("Failed to read response body")?;
                        return Ok(body.to_vec());
                    } else if status.as_u16() == 429 || status.as_u16() == 503 {
                        let backoff = rate_limit_backoff(self.retry_delay_ms, attempt);
                        warn!("Rate limited ({}) on attempt {}, sleeping {:?}", status, attempt, backoff);
                        sleep(backoff).await;
                        last_err = anyhow!("HTTP {}", status);
                    } else {
                        last_err = anyhow!("HTTP error {}", status);
                        break;
                    }
                }
                Err(e) => {
                    last_err = anyhow!("Request error: {}", e);
                    let backoff =
                        Duration::from_millis(self.retry_delay_ms.saturating_mul(attempt as u64));
                    warn!("Request failed on attempt {}: {}", attempt, e);
                    sleep(backoff).await;
                }
            }
        }

        Err(last_err).with_context(|| format!("All retries exhausted for {}", url))
    }
}

/// `delay_ms * 2^attempt`, capped instead of overflowing.
fn rate_limit_backoff(delay_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(delay_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Substitute `{page}` and `{code}` and parse the result.
pub fn expand(template: &str, page: &str, code: &str) -> Result<Url> {
    let raw = template.replace("{page}", page).replace("{code}", code);
    Url::parse(&raw).map_err(|e| {
        BatchError::InvalidUrlTemplate {
            template: template.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[async_trait]
impl FetchWorker for HttpWorker {
    async fn fetch(&self, item: &WorkItem) -> Result<()> {
        let url = expand(&self.url_template, item.data_type.spec().folder, &item.code)?;
        let body = self.get_bytes(&url).await?;
        if body.is_empty() {
            return Err(anyhow!("empty response from {}", url));
        }

        let part = item.artifact.with_extension("xls.part");
        tokio::fs::write(&part, &body)
            .await
            .with_context(|| format!("Failed to write {:?}", part))?;
        tokio::fs::rename(&part, &item.artifact)
            .await
            .with_context(|| format!("Failed to move {:?} into place", part))?;

        debug!("{}: {} bytes -> {}", item.code, body.len(), item.filename);
        Ok(())
    }
}
