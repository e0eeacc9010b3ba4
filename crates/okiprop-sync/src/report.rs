//! Point-in-time report of active listings, exported as Parquet with a manifest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use okiprop_core::{Listing, EMPTY_MARKER};
use okiprop_storage::{ArtifactStore, PropertyStore, StorageResult, StoredArtifact};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::info;

/// Column order of the exported report.
pub const REPORT_COLUMNS: [&str; 9] = [
    "type",
    "price",
    "size",
    "location",
    "building_name",
    "madori",
    "chikunensu",
    "url",
    "last_seen",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    #[serde(rename = "type")]
    pub property_type: String,
    pub price: i64,
    pub size: f64,
    pub location: String,
    pub building_name: String,
    pub madori: String,
    pub chikunensu: String,
    pub url: String,
    pub last_seen: NaiveDate,
}

fn or_marker(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| EMPTY_MARKER.to_string())
}

impl From<&Listing> for ReportRow {
    fn from(listing: &Listing) -> Self {
        let property_type = if listing.property_type.trim().is_empty() {
            EMPTY_MARKER.to_string()
        } else {
            listing.property_type.clone()
        };
        Self {
            property_type,
            price: listing.price,
            size: listing.size,
            location: listing.location.clone(),
            building_name: or_marker(&listing.building_name),
            madori: or_marker(&listing.madori),
            chikunensu: or_marker(&listing.chikunensu),
            url: listing.url.clone(),
            last_seen: listing.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub name: String,
    pub as_of: NaiveDate,
    pub rows: Vec<ReportRow>,
}

pub fn report_name(as_of: NaiveDate) -> String {
    format!("report_{}", as_of.format("%Y%m%d"))
}

/// Projects the listing store into a report. Never writes to the store.
pub struct ReportBuilder<'a> {
    store: &'a PropertyStore,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(store: &'a PropertyStore) -> Self {
        Self { store }
    }

    /// All active listings, cheapest first.
    pub async fn build(&self, as_of: NaiveDate) -> StorageResult<Report> {
        let mut active = self.store.list_active().await?;
        active.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        Ok(Report {
            name: report_name(as_of),
            as_of,
            rows: active.iter().map(ReportRow::from).collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub report: String,
    pub as_of: NaiveDate,
    pub rows: usize,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl ReportManifestFile {
    fn from_artifact(name: &str, artifact: &StoredArtifact) -> Self {
        Self {
            name: name.to_string(),
            path: artifact.relative_path.display().to_string(),
            sha256: artifact.sha256.clone(),
            bytes: artifact.byte_size as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub parquet_path: PathBuf,
    pub brief_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Writes reports under `<root>/<YYYY-MM-DD>/`. A second run on the same date replaces the
/// day's files.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    artifacts: ArtifactStore,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            artifacts: ArtifactStore::new(root),
        }
    }

    pub async fn write(&self, report: &Report, daily_brief: &str) -> Result<WrittenReport> {
        let day_dir = PathBuf::from(report.as_of.format("%Y-%m-%d").to_string());

        let parquet_bytes = report_to_parquet(report)?;
        let parquet = self
            .artifacts
            .write_atomic(day_dir.join(format!("{}.parquet", report.name)), &parquet_bytes)
            .await?;
        if parquet.replaced {
            info!(report = %report.name, "replaced the earlier report for this date");
        }
        let brief = self
            .artifacts
            .write_atomic(day_dir.join("daily_brief.md"), daily_brief.as_bytes())
            .await?;

        let manifest = ReportManifest {
            schema_version: 1,
            report: report.name.clone(),
            as_of: report.as_of,
            rows: report.rows.len(),
            files: vec![
                ReportManifestFile::from_artifact("listings", &parquet),
                ReportManifestFile::from_artifact("daily_brief", &brief),
            ],
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        let manifest = self
            .artifacts
            .write_atomic(day_dir.join("manifest.json"), &manifest_bytes)
            .await?;

        Ok(WrittenReport {
            parquet_path: parquet.absolute_path,
            brief_path: brief.absolute_path,
            manifest_path: manifest.absolute_path,
        })
    }
}

fn utf8_column(rows: &[ReportRow], f: impl Fn(&ReportRow) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(
        rows.iter().map(|r| Some(f(r))).collect::<Vec<_>>(),
    ))
}

pub fn report_to_parquet(report: &Report) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("type", DataType::Utf8, false),
        ArrowField::new("price", DataType::Int64, false),
        ArrowField::new("size", DataType::Float64, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("building_name", DataType::Utf8, false),
        ArrowField::new("madori", DataType::Utf8, false),
        ArrowField::new("chikunensu", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("last_seen", DataType::Utf8, false),
    ]));

    let rows = &report.rows;
    let last_seen: Vec<String> = rows
        .iter()
        .map(|r| r.last_seen.format("%Y-%m-%d").to_string())
        .collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8_column(rows, |r| &r.property_type),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.size).collect::<Vec<_>>())),
            utf8_column(rows, |r| &r.location),
            utf8_column(rows, |r| &r.building_name),
            utf8_column(rows, |r| &r.madori),
            utf8_column(rows, |r| &r.chikunensu),
            utf8_column(rows, |r| &r.url),
            Arc::new(StringArray::from(
                last_seen.iter().map(|d| Some(d.as_str())).collect::<Vec<_>>(),
            )),
        ],
    )
    .with_context(|| format!("building {} record batch", report.name))?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {}", report.name))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch for {}", report.name))?;
    writer
        .into_inner()
        .with_context(|| format!("closing parquet writer for {}", report.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use okiprop_core::RawListing;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    use crate::reconcile::Reconciler;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).expect("valid date")
    }

    fn raw(title: &str, price: &str) -> RawListing {
        RawListing {
            title: title.to_string(),
            price_text: price.to_string(),
            size_text: "85.5㎡".to_string(),
            location: "浦添市".to_string(),
            url: format!("https://www.e-uchina.net/bukken/{title}/detail.html"),
            madori: Some("3LDK".to_string()),
            ..Default::default()
        }
    }

    async fn seeded_store() -> PropertyStore {
        let store = PropertyStore::in_memory().await.unwrap();
        let reconciler = Reconciler::new(&store);
        reconciler
            .reconcile("house", &[raw("gone", "1500万円"), raw("h", "4,200万円")], day(1))
            .await
            .unwrap();
        reconciler
            .reconcile("house", &[raw("h", "4,200万円"), raw("h2", "2,100万円")], day(2))
            .await
            .unwrap();
        reconciler
            .reconcile("mansion", &[raw("m", "3,000万円")], day(2))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn report_lists_active_listings_by_ascending_price() {
        let store = seeded_store().await;
        let report = ReportBuilder::new(&store).build(day(2)).await.unwrap();

        assert_eq!(report.name, "report_20261002");
        let prices: Vec<_> = report.rows.iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![2100, 3000, 4200]);
        assert!(report.rows.iter().all(|r| r.price != 1500));

        let first = &report.rows[0];
        assert_eq!(first.property_type, "house");
        assert_eq!(first.building_name, EMPTY_MARKER);
        assert_eq!(first.chikunensu, EMPTY_MARKER);
        assert_eq!(first.madori, "3LDK");
        assert_eq!(first.last_seen, day(2));
    }

    #[tokio::test]
    async fn building_a_report_does_not_mutate_the_store() {
        let store = seeded_store().await;
        let before = store.list_active().await.unwrap();
        ReportBuilder::new(&store).build(day(9)).await.unwrap();
        assert_eq!(store.list_active().await.unwrap(), before);
    }

    #[tokio::test]
    async fn written_report_has_fixed_columns_and_manifest() {
        let store = seeded_store().await;
        let report = ReportBuilder::new(&store).build(day(2)).await.unwrap();
        let dir = tempdir().unwrap();
        let written = ReportWriter::new(dir.path())
            .write(&report, "# brief\n")
            .await
            .unwrap();

        assert!(written
            .parquet_path
            .ends_with("2026-10-02/report_20261002.parquet"));

        let file = std::fs::File::open(&written.parquet_path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(columns, REPORT_COLUMNS.map(String::from).to_vec());
        let rows: usize = builder.build().unwrap().map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["rows"], 3);
        assert_eq!(manifest["files"].as_array().unwrap().len(), 2);
    }
}
