use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use okiprop_adapters::{AdapterError, FixtureSource, ListingSource, SearchQuery};
use okiprop_core::{identify, RawListing};
use okiprop_storage::PropertyStore;
use okiprop_sync::{
    CycleRunner, CycleStatus, NotifyBackend, NotifyFanout, ReportWriter, SearchRegistry,
    SourceMode,
};
use tempfile::TempDir;

const REGISTRY: &str = r#"
searches:
  - category: house
    display_name: houses
    enabled: true
    mode: live
    url: https://www.e-uchina.net/house/urasoeshi/uchima
  - category: mansion
    display_name: flats
    enabled: true
    mode: live
    url: https://www.e-uchina.net/mansion/urasoeshi/miyagi
"#;

/// Serves whatever batch the test scripted for each category.
#[derive(Default)]
struct ScriptedSource {
    batches: Mutex<HashMap<String, Result<Vec<RawListing>, String>>>,
}

impl ScriptedSource {
    fn set(&self, category: &str, batch: Vec<RawListing>) {
        self.batches
            .lock()
            .unwrap()
            .insert(category.to_string(), Ok(batch));
    }

    fn fail(&self, category: &str, reason: &str) {
        self.batches
            .lock()
            .unwrap()
            .insert(category.to_string(), Err(reason.to_string()));
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_listings(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError> {
        match self.batches.lock().unwrap().get(&query.category) {
            Some(Ok(batch)) => Ok(batch.clone()),
            Some(Err(reason)) => Err(AdapterError::Message(reason.clone())),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl NotifyBackend for Inbox {
    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn send_summary(&self, message: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

struct Harness {
    store: PropertyStore,
    source: Arc<ScriptedSource>,
    inbox: Inbox,
    runner: CycleRunner,
    _reports: TempDir,
}

async fn harness() -> Harness {
    let store = PropertyStore::in_memory().await.unwrap();
    let source = Arc::new(ScriptedSource::default());
    let inbox = Inbox::default();
    let reports = tempfile::tempdir().unwrap();
    let registry = SearchRegistry::from_yaml(REGISTRY).unwrap();
    let runner = CycleRunner::new(
        store.clone(),
        &registry,
        ReportWriter::new(reports.path()),
        NotifyFanout::new(vec![Box::new(inbox.clone())]),
    )
    .with_source(SourceMode::Live, source.clone());
    Harness {
        store,
        source,
        inbox,
        runner,
        _reports: reports,
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).expect("valid date")
}

fn listing(title: &str, price: i64, size: f64, location: &str) -> RawListing {
    RawListing {
        title: title.to_string(),
        price_text: format!("{price}万円"),
        size_text: format!("{size}㎡"),
        location: location.to_string(),
        url: format!("https://www.e-uchina.net/bukken/{title}/detail.html"),
        ..Default::default()
    }
}

#[tokio::test]
async fn three_day_scenario_deactivates_then_reactivates() {
    let h = harness().await;
    let id = identify("A", 3000, 80.0, "X", "house");

    h.source.set("house", vec![listing("A", 3000, 80.0, "X")]);
    let day1 = h.runner.run_once(day(1)).await;
    assert_eq!(day1.status, CycleStatus::Completed);
    let row = h.store.get(&id).await.unwrap().expect("inserted");
    assert!(row.is_active);
    assert_eq!(h.store.history_for(&id).await.unwrap().len(), 1);

    h.source.set("house", Vec::new());
    let day2 = h.runner.run_once(day(2)).await;
    assert_eq!(day2.status, CycleStatus::Completed);
    let row = h.store.get(&id).await.unwrap().unwrap();
    assert!(!row.is_active);
    assert_eq!(row.last_seen, day(1));
    assert_eq!(h.store.history_for(&id).await.unwrap().len(), 1);

    h.source.set("house", vec![listing("A", 2900, 80.0, "X")]);
    let day3 = h.runner.run_once(day(3)).await;
    let row = h.store.get(&id).await.unwrap().unwrap();
    assert!(row.is_active);
    assert_eq!(row.last_seen, day(3));
    assert_eq!(row.price, 2900);
    let series: Vec<_> = h
        .store
        .history_for(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.date, p.price))
        .collect();
    assert_eq!(series, vec![(day(1), 3000), (day(3), 2900)]);
    assert_eq!(day3.categories[0].price_changed_titles(), vec!["A"]);
    assert_eq!(day3.price_change_count(), 1);

    let messages = h.inbox.0.lock().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(
        messages[2],
        "物件情報を更新しました（1件）\n💰 価格変更: 1件\n2026/10/03"
    );
}

#[tokio::test]
async fn same_day_rerun_converges() {
    let h = harness().await;
    h.source.set(
        "house",
        vec![listing("A", 3000, 80.0, "X"), listing("B", 2500, 90.0, "Y")],
    );
    h.source.set("mansion", vec![listing("M", 2800, 70.0, "Z")]);

    h.runner.run_once(day(1)).await;
    let active_before = h.store.list_active().await.unwrap();
    let history_before = h
        .store
        .history_for(&identify("A", 3000, 80.0, "X", "house"))
        .await
        .unwrap();

    let rerun = h.runner.run_once(day(1)).await;
    assert_eq!(rerun.price_change_count(), 0);
    assert_eq!(rerun.categories.iter().map(|c| c.inserted).sum::<usize>(), 0);
    assert_eq!(rerun.categories.iter().map(|c| c.history_appended).sum::<usize>(), 0);
    assert_eq!(h.store.list_active().await.unwrap(), active_before);
    assert_eq!(
        h.store
            .history_for(&identify("A", 3000, 80.0, "X", "house"))
            .await
            .unwrap(),
        history_before
    );
}

#[tokio::test]
async fn house_batch_never_deactivates_mansions() {
    let h = harness().await;
    h.source.set("house", vec![listing("A", 3000, 80.0, "X")]);
    h.source.set("mansion", vec![listing("M", 2800, 70.0, "Z")]);
    h.runner.run_once(day(1)).await;

    h.source.set("house", vec![listing("B", 2500, 90.0, "Y")]);
    h.runner.run_once(day(2)).await;

    let mansion = h
        .store
        .get(&identify("M", 2800, 70.0, "Z", "mansion"))
        .await
        .unwrap()
        .unwrap();
    assert!(mansion.is_active);
    let inactive: Vec<_> = h
        .store
        .list_inactive()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.title)
        .collect();
    assert_eq!(inactive, vec!["A".to_string()]);
}

#[tokio::test]
async fn fetch_failure_degrades_without_touching_the_category() {
    let h = harness().await;
    h.source.set("house", vec![listing("A", 3000, 80.0, "X")]);
    h.source.set("mansion", vec![listing("M", 2800, 70.0, "Z")]);
    h.runner.run_once(day(1)).await;

    h.source.fail("mansion", "connection reset");
    h.source.set("house", vec![listing("A", 3000, 80.0, "X")]);
    let summary = h.runner.run_once(day(2)).await;

    assert_eq!(summary.status, CycleStatus::Degraded);
    assert_eq!(summary.status.exit_code(), 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].category, "mansion");
    assert!(summary.message.ends_with("⚠ 取得失敗: mansion"));

    let mansion = h
        .store
        .get(&identify("M", 2800, 70.0, "Z", "mansion"))
        .await
        .unwrap()
        .unwrap();
    assert!(mansion.is_active);
    assert_eq!(mansion.last_seen, day(1));
    assert_eq!(summary.report_rows, Some(2));
}

#[tokio::test]
async fn storage_failure_is_fatal() {
    let h = harness().await;
    h.source.set("house", vec![listing("A", 3000, 80.0, "X")]);
    h.store.clone().close().await;

    let summary = h.runner.run_once(day(1)).await;

    assert_eq!(summary.status, CycleStatus::Fatal);
    assert_eq!(summary.status.exit_code(), 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].category, "house");
    assert!(summary.categories.is_empty());
    assert_eq!(summary.report_path, None);
    assert_eq!(h.inbox.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn report_is_written_sorted_by_price() {
    let h = harness().await;
    h.source.set(
        "house",
        vec![listing("A", 3000, 80.0, "X"), listing("B", 2500, 90.0, "Y")],
    );
    h.source.set("mansion", vec![listing("M", 2800, 70.0, "Z")]);
    let summary = h.runner.run_once(day(1)).await;

    let path = summary.report_path.expect("report written");
    assert!(Path::new(&path).exists());
    assert!(path.ends_with("report_20261001.parquet"));

    let report = okiprop_sync::ReportBuilder::new(&h.store)
        .build(day(1))
        .await
        .unwrap();
    let prices: Vec<_> = report.rows.iter().map(|r| r.price).collect();
    assert_eq!(prices, vec![2500, 2800, 3000]);
}

#[tokio::test]
async fn fixture_pages_drive_a_full_cycle() {
    let store = PropertyStore::in_memory().await.unwrap();
    let reports = tempfile::tempdir().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    let registry = SearchRegistry::from_yaml(&REGISTRY.replace("mode: live", "mode: fixture")).unwrap();
    let runner = CycleRunner::new(
        store.clone(),
        &registry,
        ReportWriter::new(reports.path()),
        NotifyFanout::new(Vec::new()),
    )
    .with_source(SourceMode::Fixture, Arc::new(FixtureSource::new(fixtures)));

    let summary = runner.run_once(day(1)).await;

    assert_eq!(summary.status, CycleStatus::Completed);
    let house = &summary.categories[0];
    assert_eq!(house.fetched, 3);
    assert_eq!(house.parse_failures, 1);
    assert_eq!(house.inserted, 2);
    assert_eq!(summary.touched(), 3);
    assert_eq!(store.list_active().await.unwrap().len(), 3);
}

#[tokio::test]
async fn page_without_results_degrades_instead_of_deactivating() {
    let store = PropertyStore::in_memory().await.unwrap();
    let reports = tempfile::tempdir().unwrap();
    let pages = tempfile::tempdir().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    for category in ["house", "mansion"] {
        std::fs::create_dir_all(pages.path().join(category)).unwrap();
        std::fs::copy(
            fixtures.join(category).join("search.html"),
            pages.path().join(category).join("search.html"),
        )
        .unwrap();
    }
    let registry = SearchRegistry::from_yaml(&REGISTRY.replace("mode: live", "mode: fixture")).unwrap();
    let runner = CycleRunner::new(
        store.clone(),
        &registry,
        ReportWriter::new(reports.path()),
        NotifyFanout::new(Vec::new()),
    )
    .with_source(SourceMode::Fixture, Arc::new(FixtureSource::new(pages.path())));

    assert_eq!(runner.run_once(day(1)).await.status, CycleStatus::Completed);
    let active_before = store.list_active().await.unwrap();
    assert_eq!(active_before.len(), 3);

    std::fs::write(
        pages.path().join("house/search.html"),
        r#"<html><body><div id="app">Loading...</div></body></html>"#,
    )
    .unwrap();
    let summary = runner.run_once(day(2)).await;

    assert_eq!(summary.status, CycleStatus::Degraded);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].category, "house");
    assert!(summary.categories.iter().all(|c| c.deactivated == 0));
    assert!(store.list_inactive().await.unwrap().is_empty());
    assert_eq!(store.list_active().await.unwrap().len(), 3);
}
