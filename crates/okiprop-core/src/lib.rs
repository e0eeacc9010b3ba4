//! Core domain model for okiprop: raw scraped listings, persisted listings and price history.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod identity;
pub mod parse;

pub use identity::{identify, ListingId};
pub use parse::{parse_price_man_yen, parse_size_sqm, ParseFailure};

pub const CRATE_NAME: &str = "okiprop-core";

/// Written in place of missing descriptive fields in reports.
pub const EMPTY_MARKER: &str = "";

/// One search-result entry exactly as the fetcher extracted it. Price and size are still text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawListing {
    pub title: String,
    pub price_text: String,
    pub size_text: String,
    pub location: String,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub madori: Option<String>,
    #[serde(default)]
    pub chikunensu: Option<String>,
    pub url: String,
}

impl RawListing {
    /// Parse price and size and tag the listing with its category.
    pub fn validate(&self, property_type: &str) -> Result<ListingDraft, ParseFailure> {
        let price = parse_price_man_yen(&self.price_text)?;
        let size = parse_size_sqm(&self.size_text)?;
        Ok(ListingDraft {
            title: self.title.trim().to_string(),
            price,
            size,
            location: self.location.trim().to_string(),
            url: self.url.trim().to_string(),
            building_name: non_empty(self.building_name.as_deref()),
            madori: non_empty(self.madori.as_deref()),
            chikunensu: non_empty(self.chikunensu.as_deref()),
            property_type: property_type.to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// A validated listing observation, ready to be reconciled against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub title: String,
    /// Price in units of 10,000 JPY.
    pub price: i64,
    /// Building area in square metres.
    pub size: f64,
    pub location: String,
    pub url: String,
    pub building_name: Option<String>,
    pub madori: Option<String>,
    pub chikunensu: Option<String>,
    #[serde(rename = "type")]
    pub property_type: String,
}

impl ListingDraft {
    pub fn identity(&self) -> ListingId {
        identify(
            &self.title,
            self.price,
            self.size,
            &self.location,
            &self.property_type,
        )
    }
}

/// Persisted listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub price: i64,
    pub size: f64,
    pub location: String,
    pub url: String,
    pub building_name: Option<String>,
    pub madori: Option<String>,
    pub chikunensu: Option<String>,
    #[serde(rename = "type")]
    pub property_type: String,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub is_active: bool,
}

/// One price observation. At most one exists per (listing, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub listing_id: ListingId,
    pub date: NaiveDate,
    pub price: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(price: &str, size: &str) -> RawListing {
        RawListing {
            title: " 浦添市内間 中古戸建 ".to_string(),
            price_text: price.to_string(),
            size_text: size.to_string(),
            location: "浦添市内間".to_string(),
            madori: Some("4LDK".to_string()),
            chikunensu: Some("  ".to_string()),
            url: "https://www.e-uchina.net/bukken/house/h-1/detail.html".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_parses_price_and_size_and_trims_text() {
        let draft = raw("2,980万円", "建物 85.3㎡").validate("house").unwrap();
        assert_eq!(draft.title, "浦添市内間 中古戸建");
        assert_eq!(draft.price, 2980);
        assert_eq!(draft.size, 85.3);
        assert_eq!(draft.property_type, "house");
        assert_eq!(draft.madori.as_deref(), Some("4LDK"));
        assert_eq!(draft.chikunensu, None);
    }

    #[test]
    fn validate_rejects_missing_size() {
        let err = raw("2,980万円", "").validate("house").unwrap_err();
        assert_eq!(err, ParseFailure::MissingSize);
    }

    #[test]
    fn draft_identity_matches_identify() {
        let draft = raw("3000", "80").validate("house").unwrap();
        assert_eq!(
            draft.identity(),
            identify("浦添市内間 中古戸建", 3000, 80.0, "浦添市内間", "house")
        );
    }
}
