//! Environment configuration and the search registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use okiprop_adapters::SearchQuery;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRegistry {
    pub searches: Vec<SearchConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub category: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    pub url: String,
}

impl SearchConfig {
    pub fn query(&self) -> SearchQuery {
        SearchQuery {
            category: self.category.clone(),
            url: self.url.clone(),
        }
    }
}

impl SearchRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SearchRegistry = serde_yaml::from_str(text).context("parsing search registry")?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut urls = HashSet::new();
        for search in &self.searches {
            if search.category.trim().is_empty() {
                bail!("search {:?} has an empty category", search.display_name);
            }
            if !urls.insert((search.category.as_str(), search.url.as_str())) {
                bail!(
                    "search url {} is listed twice for category {}",
                    search.url,
                    search.category
                );
            }
        }
        Ok(())
    }

    /// Enabled searches grouped by category, in first-appearance order.
    pub fn enabled_by_category(&self) -> Vec<(String, Vec<SearchConfig>)> {
        let mut groups: Vec<(String, Vec<SearchConfig>)> = Vec::new();
        for search in self.searches.iter().filter(|s| s.enabled) {
            match groups.iter_mut().find(|(category, _)| *category == search.category) {
                Some((_, members)) => members.push(search.clone()),
                None => groups.push((search.category.clone(), vec![search.clone()])),
            }
        }
        groups
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub notify_timeout_secs: u64,
    pub line_channel_token: Option<String>,
    pub line_to: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub postmark_server_token: Option<String>,
    pub email_from: Option<String>,
    pub email_to: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("OKIPROP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://properties.db".to_string()),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            fixtures_dir: std::env::var("OKIPROP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("fixtures")),
            user_agent: std::env::var("OKIPROP_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0 (compatible; okiprop/0.1)".to_string()),
            http_timeout_secs: std::env::var("OKIPROP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: std::env::var("OKIPROP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            notify_timeout_secs: std::env::var("OKIPROP_NOTIFY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            line_channel_token: env_opt("LINE_CHANNEL_TOKEN"),
            line_to: env_opt("LINE_TO"),
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            postmark_server_token: env_opt("POSTMARK_SERVER_TOKEN"),
            email_from: env_opt("NOTIFY_EMAIL_FROM"),
            email_to: env_opt("NOTIFY_EMAIL_TO"),
            workspace_root,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("searches.yaml")
    }

    pub async fn load_registry(&self) -> Result<SearchRegistry> {
        load_registry(&self.registry_path()).await
    }
}

pub async fn load_registry(path: &Path) -> Result<SearchRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    SearchRegistry::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
}
