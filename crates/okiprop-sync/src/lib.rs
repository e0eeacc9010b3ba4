//! Ingestion cycle for tracked property searches: fetch, reconcile, report, notify.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use okiprop_adapters::{EUchinaAdapter, FixtureSource};
use okiprop_storage::{HttpClientConfig, HttpFetcher, PropertyStore};

pub mod config;
pub mod cycle;
pub mod notify;
pub mod reconcile;
pub mod report;

pub use config::{load_registry, SearchConfig, SearchRegistry, SourceMode, SyncConfig};
pub use cycle::{compose_message, CategoryFailure, CycleRunner, CycleStatus, CycleSummary, FailureKind};
pub use notify::{
    DeliveryReport, LinePush, NoopBackend, NotifyBackend, NotifyFanout, PostmarkEmail, SlackWebhook,
};
pub use reconcile::{PriceChange, ReconcileError, ReconcileOutcome, Reconciler};
pub use report::{report_name, Report, ReportBuilder, ReportRow, ReportWriter, WrittenReport};

pub const CRATE_NAME: &str = "okiprop-sync";

fn http_fetcher(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        max_retries: config.http_max_retries,
        ..Default::default()
    })
}

/// Run one full cycle for `run_date` with configuration taken from the environment.
///
/// Startup problems (registry, database, HTTP client) are errors; everything after that is
/// reported through the returned summary's status.
pub async fn run_sync_once_from_env(run_date: NaiveDate) -> Result<CycleSummary> {
    let config = SyncConfig::from_env();
    let registry = config.load_registry().await?;
    let http = http_fetcher(&config)?;
    let notifier = NotifyFanout::from_config(&config)?;
    let store = PropertyStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let runner = CycleRunner::new(
        store.clone(),
        &registry,
        ReportWriter::new(config.reports_dir.clone()),
        notifier,
    )
    .with_source(SourceMode::Live, Arc::new(EUchinaAdapter::new(http)))
    .with_source(
        SourceMode::Fixture,
        Arc::new(FixtureSource::new(config.fixtures_dir.clone())),
    );

    let summary = runner.run_once(run_date).await;
    drop(runner);
    store.close().await;
    Ok(summary)
}

/// Rebuild and write the report for `as_of` from the current store without fetching.
pub async fn write_report_from_env(as_of: NaiveDate) -> Result<WrittenReport> {
    let config = SyncConfig::from_env();
    let store = PropertyStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let report = ReportBuilder::new(&store)
        .build(as_of)
        .await
        .context("building report")?;
    let brief = format!(
        "# 物件日報\n\n- Date: {}\n- Active listings: {}\n- Rebuilt without fetching\n",
        as_of.format("%Y-%m-%d"),
        report.rows.len()
    );
    let written = ReportWriter::new(config.reports_dir.clone())
        .write(&report, &brief)
        .await?;
    store.close().await;
    Ok(written)
}
