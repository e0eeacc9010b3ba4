//! One ingestion cycle: fetch every category, reconcile, report, notify.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use okiprop_adapters::ListingSource;
use okiprop_core::{Listing, RawListing};
use okiprop_storage::PropertyStore;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SearchConfig, SearchRegistry, SourceMode};
use crate::notify::{DeliveryReport, NotifyFanout};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::report::{ReportBuilder, ReportWriter, WrittenReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Every category was fetched and reconciled.
    Completed,
    /// At least one category could not be fetched and kept its previous state.
    Degraded,
    /// A storage failure aborted the remaining categories.
    Fatal,
}

impl CycleStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            CycleStatus::Completed => 0,
            CycleStatus::Degraded => 2,
            CycleStatus::Fatal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Degraded => "degraded",
            CycleStatus::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryFailure {
    pub category: String,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub categories: Vec<ReconcileOutcome>,
    pub failures: Vec<CategoryFailure>,
    pub report_rows: Option<usize>,
    pub report_path: Option<String>,
    pub message: String,
    pub delivery: DeliveryReport,
}

impl CycleSummary {
    pub fn touched(&self) -> usize {
        self.categories.iter().map(ReconcileOutcome::touched).sum()
    }

    pub fn price_change_count(&self) -> usize {
        self.categories.iter().map(|c| c.price_changes.len()).sum()
    }
}

/// The plain-text summary handed to every notification channel.
pub fn compose_message(
    touched: usize,
    price_changes: usize,
    run_date: NaiveDate,
    failures: &[CategoryFailure],
) -> String {
    let mut msg = format!("物件情報を更新しました（{touched}件）\n💰 価格変更: {price_changes}件\n");
    msg.push_str(&run_date.format("%Y/%m/%d").to_string());
    for failure in failures {
        match failure.kind {
            FailureKind::Fetch => msg.push_str(&format!("\n⚠ 取得失敗: {}", failure.category)),
            FailureKind::Storage => msg.push_str(&format!(
                "\n🛑 保存失敗: {}（以降の更新を中止）",
                failure.category
            )),
        }
    }
    msg
}

fn daily_brief(
    run_id: Uuid,
    run_date: NaiveDate,
    status: CycleStatus,
    outcomes: &[ReconcileOutcome],
    failures: &[CategoryFailure],
    new_today: &[Listing],
    active_rows: usize,
) -> String {
    let mut lines = vec![
        "# 物件日報".to_string(),
        String::new(),
        format!("- Run ID: `{run_id}`"),
        format!("- Date: {}", run_date.format("%Y-%m-%d")),
        format!("- Status: {}", status.as_str()),
        format!("- Active listings: {active_rows}"),
        String::new(),
        "## Categories".to_string(),
    ];
    for o in outcomes {
        lines.push(format!(
            "- {}: fetched {}, inserted {}, updated {}, deactivated {}, parse failures {}",
            o.category, o.fetched, o.inserted, o.updated, o.deactivated, o.parse_failures
        ));
    }
    for f in failures {
        lines.push(format!("- {}: failed ({:?}) {}", f.category, f.kind, f.error));
    }

    let changes: Vec<_> = outcomes.iter().flat_map(|o| o.price_changes.iter()).collect();
    if !changes.is_empty() {
        lines.push(String::new());
        lines.push("## Price changes".to_string());
        for c in changes {
            lines.push(format!("- {}: {}万円 → {}万円", c.title, c.previous_price, c.price));
        }
    }
    if !new_today.is_empty() {
        lines.push(String::new());
        lines.push("## New today".to_string());
        for l in new_today {
            lines.push(format!("- [{}] {} {}万円 {}", l.property_type, l.title, l.price, l.url));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Runs ingestion cycles against one store. Categories are processed sequentially, each in
/// its own transaction.
pub struct CycleRunner {
    store: PropertyStore,
    searches: Vec<(String, Vec<SearchConfig>)>,
    sources: HashMap<SourceMode, Arc<dyn ListingSource>>,
    reports: ReportWriter,
    notifier: NotifyFanout,
}

impl CycleRunner {
    pub fn new(
        store: PropertyStore,
        registry: &SearchRegistry,
        reports: ReportWriter,
        notifier: NotifyFanout,
    ) -> Self {
        Self {
            store,
            searches: registry.enabled_by_category(),
            sources: HashMap::new(),
            reports,
            notifier,
        }
    }

    pub fn with_source(mut self, mode: SourceMode, source: Arc<dyn ListingSource>) -> Self {
        self.sources.insert(mode, source);
        self
    }

    pub async fn run_once(&self, run_date: NaiveDate) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id, %run_date);
        self.run_inner(run_id, run_date).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, run_date: NaiveDate) -> CycleSummary {
        let started_at = Utc::now();
        let reconciler = Reconciler::new(&self.store);
        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        let mut status = CycleStatus::Completed;

        for (category, searches) in &self.searches {
            let batch = match self.fetch_category(category, searches).await {
                Ok(batch) => batch,
                Err(err) => {
                    let err = format!("{err:#}");
                    warn!(category = %category, error = %err, "fetch failed; category keeps previous state");
                    failures.push(CategoryFailure {
                        category: category.clone(),
                        kind: FailureKind::Fetch,
                        error: err,
                    });
                    status = CycleStatus::Degraded;
                    continue;
                }
            };

            match reconciler.reconcile(category, &batch, run_date).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(category = %category, error = %err, "storage failure; aborting remaining categories");
                    failures.push(CategoryFailure {
                        category: category.clone(),
                        kind: FailureKind::Storage,
                        error: err.to_string(),
                    });
                    status = CycleStatus::Fatal;
                    break;
                }
            }
        }

        let (report_rows, written) = self
            .write_report(run_id, run_date, status, &outcomes, &failures)
            .await;

        let touched = outcomes.iter().map(ReconcileOutcome::touched).sum();
        let price_changes = outcomes.iter().map(|o| o.price_changes.len()).sum();
        let message = compose_message(touched, price_changes, run_date, &failures);
        let delivery = self.notifier.deliver(&message).await;

        let finished_at = Utc::now();
        info!(
            status = status.as_str(),
            touched,
            price_changes,
            failures = failures.len(),
            "cycle finished"
        );

        CycleSummary {
            run_id,
            run_date,
            started_at,
            finished_at,
            status,
            categories: outcomes,
            failures,
            report_rows,
            report_path: written.map(|w| w.parquet_path.display().to_string()),
            message,
            delivery,
        }
    }

    /// Every search of a category must succeed, otherwise a partial batch would deactivate
    /// listings that were simply not fetched.
    async fn fetch_category(
        &self,
        category: &str,
        searches: &[SearchConfig],
    ) -> anyhow::Result<Vec<RawListing>> {
        let mut batch = Vec::new();
        for search in searches {
            let source = self
                .sources
                .get(&search.mode)
                .with_context(|| format!("no listing source registered for mode {:?}", search.mode))?;
            let listings = source
                .fetch_listings(&search.query())
                .await
                .with_context(|| format!("fetching {} via {}", search.display_name, source.source_id()))?;
            info!(category, search = %search.display_name, listings = listings.len(), "fetched search");
            batch.extend(listings);
        }
        Ok(batch)
    }

    async fn write_report(
        &self,
        run_id: Uuid,
        run_date: NaiveDate,
        status: CycleStatus,
        outcomes: &[ReconcileOutcome],
        failures: &[CategoryFailure],
    ) -> (Option<usize>, Option<WrittenReport>) {
        let report = match ReportBuilder::new(&self.store).build(run_date).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "building report failed");
                return (None, None);
            }
        };
        let new_today = match self.store.list_first_seen_on(run_date).await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(error = %err, "listing new arrivals failed");
                Vec::new()
            }
        };
        let brief = daily_brief(
            run_id,
            run_date,
            status,
            outcomes,
            failures,
            &new_today,
            report.rows.len(),
        );
        match self.reports.write(&report, &brief).await {
            Ok(written) => {
                info!(rows = report.rows.len(), path = %written.parquet_path.display(), "report written");
                (Some(report.rows.len()), Some(written))
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "writing report failed");
                (Some(report.rows.len()), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).expect("valid date")
    }

    #[test]
    fn message_states_counts_and_date() {
        assert_eq!(
            compose_message(5, 1, day(17), &[]),
            "物件情報を更新しました（5件）\n💰 価格変更: 1件\n2026/10/17"
        );
    }

    #[test]
    fn message_names_failed_categories() {
        let failures = vec![
            CategoryFailure {
                category: "mansion".to_string(),
                kind: FailureKind::Fetch,
                error: "timeout".to_string(),
            },
            CategoryFailure {
                category: "land".to_string(),
                kind: FailureKind::Storage,
                error: "disk full".to_string(),
            },
        ];
        let msg = compose_message(0, 0, day(1), &failures);
        let lines: Vec<_> = msg.lines().collect();
        assert_eq!(lines[3], "⚠ 取得失敗: mansion");
        assert!(lines[4].contains("land"));
    }

    #[test]
    fn exit_codes_distinguish_outcomes() {
        assert_eq!(CycleStatus::Completed.exit_code(), 0);
        assert_eq!(CycleStatus::Degraded.exit_code(), 2);
        assert_eq!(CycleStatus::Fatal.exit_code(), 3);
    }
}
