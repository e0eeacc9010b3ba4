//! HTTP fetch with bounded retry for search-result pages.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Extra attempts after the first one for throttling, server errors and dropped
    /// connections.
    pub max_retries: usize,
    /// Wait before retry `n` is `retry_delay * n`, capped at ten seconds.
    pub retry_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed. A 403 or 404 from the site will not
    /// change by retrying; throttling, 5xx and dropped connections might.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: usize,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        })
    }

    fn delay_before_retry(&self, retry: usize) -> Duration {
        self.retry_delay
            .saturating_mul(retry as u32)
            .min(MAX_RETRY_DELAY)
    }

    /// GET `url` as text. Transient failures are retried up to the configured limit.
    pub async fn fetch_text(&self, category: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", category, url);
        async {
            let mut retry = 0usize;
            loop {
                match self.get_once(url).await {
                    Ok(page) => return Ok(page),
                    Err(err) if err.is_transient() && retry < self.max_retries => {
                        retry += 1;
                        warn!(error = %err, retry, "retrying search page fetch");
                        tokio::time::sleep(self.delay_before_retry(retry)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await.map_err(transport)?;
        Ok(FetchedPage { final_url, body })
    }
}
