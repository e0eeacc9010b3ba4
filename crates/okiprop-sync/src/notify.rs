//! Delivery of the cycle summary to chat and email channels.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::SyncConfig;

const LINE_PUSH_ENDPOINT: &str = "https://api.line.me/v2/bot/message/push";
const POSTMARK_EMAIL_ENDPOINT: &str = "https://api.postmarkapp.com/email";
const EMAIL_SUBJECT: &str = "【物件情報更新】";
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Pluggable notification channel.
#[async_trait]
pub trait NotifyBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver a plain-text summary.
    async fn send_summary(&self, message: &str) -> anyhow::Result<()>;
}

async fn ensure_success(channel: &str, resp: reqwest::Response) -> anyhow::Result<()> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!(channel, status = %status, body = %body, "notification endpoint returned non-success");
        anyhow::bail!("{channel} returned {status}");
    }
    Ok(())
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("building notification http client")
}

/// LINE Messaging API push to a single user or group.
pub struct LinePush {
    channel_token: String,
    to: String,
    http: reqwest::Client,
}

impl LinePush {
    pub fn new(channel_token: String, to: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            channel_token,
            to,
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl NotifyBackend for LinePush {
    fn name(&self) -> &'static str {
        "line"
    }

    async fn send_summary(&self, message: &str) -> anyhow::Result<()> {
        let payload = json!({
            "to": self.to,
            "messages": [{ "type": "text", "text": message }],
        });
        let resp = self
            .http
            .post(LINE_PUSH_ENDPOINT)
            .bearer_auth(&self.channel_token)
            .json(&payload)
            .send()
            .await?;
        ensure_success(self.name(), resp).await
    }
}

/// Slack incoming webhook.
pub struct SlackWebhook {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackWebhook {
    pub fn new(webhook_url: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            webhook_url,
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl NotifyBackend for SlackWebhook {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send_summary(&self, message: &str) -> anyhow::Result<()> {
        let payload = json!({
            "text": message,
            "unfurl_links": false,
        });
        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;
        ensure_success(self.name(), resp).await
    }
}

/// Plain-text email through the Postmark outbound API.
pub struct PostmarkEmail {
    server_token: String,
    from: String,
    to: String,
    endpoint: String,
    http: reqwest::Client,
}

impl PostmarkEmail {
    pub fn new(
        server_token: String,
        from: String,
        to: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            server_token,
            from,
            to,
            endpoint: POSTMARK_EMAIL_ENDPOINT.to_string(),
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl NotifyBackend for PostmarkEmail {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send_summary(&self, message: &str) -> anyhow::Result<()> {
        let payload = json!({
            "From": self.from,
            "To": self.to,
            "Subject": EMAIL_SUBJECT,
            "TextBody": message,
            "MessageStream": "outbound",
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-Postmark-Server-Token", &self.server_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;
        ensure_success(self.name(), resp).await
    }
}

/// Accepts and drops every message. Used when no channel is configured.
pub struct NoopBackend;

#[async_trait]
impl NotifyBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn send_summary(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Sends each summary to every configured channel. A channel that fails or does not answer
/// within the deadline is logged and skipped.
pub struct NotifyFanout {
    backends: Vec<Box<dyn NotifyBackend>>,
    channel_timeout: Duration,
}

impl NotifyFanout {
    pub fn new(backends: Vec<Box<dyn NotifyBackend>>) -> Self {
        Self {
            backends,
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
        }
    }

    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.notify_timeout_secs.max(1));
        let mut backends: Vec<Box<dyn NotifyBackend>> = Vec::new();
        match (&config.line_channel_token, &config.line_to) {
            (Some(token), Some(to)) => {
                backends.push(Box::new(LinePush::new(token.clone(), to.clone(), timeout)?))
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("LINE_CHANNEL_TOKEN and LINE_TO must both be set; LINE push disabled")
            }
            (None, None) => {}
        }
        if let Some(url) = &config.slack_webhook_url {
            backends.push(Box::new(SlackWebhook::new(url.clone(), timeout)?));
        }
        match (&config.postmark_server_token, &config.email_from, &config.email_to) {
            (Some(token), Some(from), Some(to)) => backends.push(Box::new(PostmarkEmail::new(
                token.clone(),
                from.clone(),
                to.clone(),
                timeout,
            )?)),
            (None, None, None) => {}
            _ => warn!(
                "POSTMARK_SERVER_TOKEN, NOTIFY_EMAIL_FROM and NOTIFY_EMAIL_TO must all be set; email disabled"
            ),
        }
        if backends.is_empty() {
            info!("no notification channel configured");
            backends.push(Box::new(NoopBackend));
        }
        Ok(Self::new(backends).with_channel_timeout(timeout))
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub async fn deliver(&self, message: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for backend in &self.backends {
            match tokio::time::timeout(self.channel_timeout, backend.send_summary(message)).await {
                Ok(Ok(())) => report.delivered.push(backend.name().to_string()),
                Ok(Err(e)) => {
                    warn!(channel = backend.name(), error = %e, "failed to deliver summary");
                    report.failed.push(backend.name().to_string());
                }
                Err(_) => {
                    warn!(
                        channel = backend.name(),
                        timeout_ms = self.channel_timeout.as_millis() as u64,
                        "channel did not answer in time"
                    );
                    report.failed.push(backend.name().to_string());
                }
            }
        }
        report
    }
}
