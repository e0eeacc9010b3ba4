//! Listing source contracts plus the e-uchina search-result adapter.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use async_trait::async_trait;
use okiprop_core::RawListing;
use okiprop_storage::{FetchError, HttpFetcher};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "okiprop-adapters";

/// One configured search: a category tag and the results page that lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub category: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("page has no search results and no empty-result notice")]
    MissingResultList,
    #[error("all {0} result blocks were malformed")]
    NoUsableResults(usize),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Capability that turns a search query into raw listings. Implementations may fail per
/// query; malformed entries should be passed through or dropped, never fatal.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listings(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError>;
}

/// Result of parsing one search-results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub listings: Vec<RawListing>,
    /// Result blocks that lacked the structure of a listing (no title, no link, short table).
    pub skipped: usize,
}

/// Notices e-uchina prints when a search legitimately matches nothing.
const NO_RESULTS_MARKERS: &[&str] = &["該当物件なし", "該当する物件がありません", "条件に一致する物件はありません"];

fn age_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(新築|築[0-9]+年|築浅)$").expect("static age pattern"))
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(item: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    item.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

struct ResultSelectors {
    item: Selector,
    title: Selector,
    price: Selector,
    location: Selector,
    cell: Selector,
    madori: Selector,
    building_name: Selector,
    tag: Selector,
    link: Selector,
}

impl ResultSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            item: selector(".search-result-item")?,
            title: selector(".head-content")?,
            price: selector(".bukken-data-price")?,
            location: selector(".search-detail-head h3 small")?,
            cell: selector("td")?,
            madori: selector(".bukken-data-madori")?,
            building_name: selector(".bukken-data-name")?,
            tag: selector(".columns span")?,
            link: selector("a[href]")?,
        })
    }
}

/// Parse an e-uchina search-results page. Relative links are resolved against `page_url`.
///
/// A page without result blocks is only an empty result when it carries a no-results notice.
/// Anything else (a script shell, a block page, a changed layout) is an error, as is a page
/// whose every block is malformed, so the caller never mistakes it for an empty category.
pub fn parse_search_results(html: &str, page_url: &str) -> Result<SearchPage, AdapterError> {
    let base = Url::parse(page_url).ok();
    let sels = ResultSelectors::new()?;
    let document = Html::parse_document(html);

    let mut page = SearchPage::default();
    for item in document.select(&sels.item) {
        let Some(title) = first_text(&item, &sels.title) else {
            page.skipped += 1;
            continue;
        };
        let cells: Vec<String> = item
            .select(&sels.cell)
            .map(|td| text_or_none(td.text().collect::<String>()).unwrap_or_default())
            .collect();
        if cells.len() < 5 {
            page.skipped += 1;
            continue;
        }
        let Some(href) = item
            .select(&sels.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
        else {
            page.skipped += 1;
            continue;
        };
        let url = match &base {
            Some(base) => base
                .join(href)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };

        let chikunensu = item
            .select(&sels.tag)
            .filter_map(|span| text_or_none(span.text().collect::<String>()))
            .find(|text| age_pattern().is_match(text));

        page.listings.push(RawListing {
            title,
            price_text: first_text(&item, &sels.price).unwrap_or_default(),
            size_text: cells[3].clone(),
            location: first_text(&item, &sels.location).unwrap_or_default(),
            building_name: first_text(&item, &sels.building_name),
            madori: first_text(&item, &sels.madori),
            chikunensu,
            url,
        });
    }

    if page.listings.is_empty() {
        if page.skipped > 0 {
            return Err(AdapterError::NoUsableResults(page.skipped));
        }
        let body: String = document.root_element().text().collect();
        if !NO_RESULTS_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Err(AdapterError::MissingResultList);
        }
    }
    Ok(page)
}

fn log_page(source_id: &str, query: &SearchQuery, page: &SearchPage) {
    info!(
        source_id,
        category = %query.category,
        listings = page.listings.len(),
        skipped = page.skipped,
        "parsed search results"
    );
    if page.skipped > 0 {
        warn!(category = %query.category, skipped = page.skipped, "skipped malformed result blocks");
    }
}

/// Fetches live search-result pages from e-uchina.net.
#[derive(Debug, Clone)]
pub struct EUchinaAdapter {
    http: HttpFetcher,
}

impl EUchinaAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ListingSource for EUchinaAdapter {
    fn source_id(&self) -> &'static str {
        "e-uchina"
    }

    async fn fetch_listings(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError> {
        let fetched = self.http.fetch_text(&query.category, &query.url).await?;
        let page = parse_search_results(&fetched.body, &fetched.final_url)?;
        log_page(self.source_id(), query, &page);
        Ok(page.listings)
    }
}

/// Reads saved search-result pages from disk: `<root>/<category>/search.html`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, category: &str) -> PathBuf {
        self.root.join(category).join("search.html")
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_listings(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError> {
        let path = self.page_path(&query.category);
        let html = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading fixture page {}", path.display()))?;
        let page = parse_search_results(&html, &query.url)?;
        log_page(self.source_id(), query, &page);
        Ok(page.listings)
    }
}
