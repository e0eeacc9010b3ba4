//! Parsing of the price and area text found on search-result pages.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("price is missing")]
    MissingPrice,
    #[error("price is not numeric: {0:?}")]
    InvalidPrice(String),
    #[error("size is missing")]
    MissingSize,
    #[error("size is not numeric: {0:?}")]
    InvalidSize(String),
}

/// Tax annotations printed after the amount. They do not change the value.
const PRICE_SUFFIXES: &[&str] = &["（税込）", "(税込)", "（税別）", "(税別)", "（非課税）"];

fn price_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(\d+)億)?(?:(\d+)万)?円?$|^(\d+)$").expect("static price pattern")
    })
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9.])([0-9]+(?:\.[0-9]+)?)\s?(?:㎡|m2|m²|平米)")
            .expect("static size pattern")
    })
}

fn strip_grouping(text: &str) -> String {
    text.chars().filter(|c| *c != ',' && *c != '，').collect()
}

/// Parse a listing price into units of 10,000 JPY.
///
/// Accepts `2,980万円`, `1億2,000万円`, `1億円` and bare integers such as `3000`. The whole
/// text must be one amount: ranges, decimal 億 and plain yen figures are rejected.
pub fn parse_price_man_yen(text: &str) -> Result<i64, ParseFailure> {
    let mut cleaned: String = strip_grouping(text)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(ParseFailure::MissingPrice);
    }
    for suffix in PRICE_SUFFIXES {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped.to_string();
            break;
        }
    }
    let invalid = || ParseFailure::InvalidPrice(text.trim().to_string());

    let caps = price_pattern().captures(&cleaned).ok_or_else(invalid)?;
    let oku = caps.get(1).map(|m| m.as_str());
    let man = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str());
    if oku.is_none() && man.is_none() {
        return Err(invalid());
    }

    let oku: i64 = match oku {
        Some(v) => v.parse().map_err(|_| invalid())?,
        None => 0,
    };
    let man: i64 = match man {
        Some(v) => v.parse().map_err(|_| invalid())?,
        None => 0,
    };
    oku.checked_mul(10_000)
        .and_then(|v| v.checked_add(man))
        .ok_or_else(invalid)
}

/// Parse a building area in square metres, e.g. `85.3㎡`, `85.3 m2` or a bare `80`.
pub fn parse_size_sqm(text: &str) -> Result<f64, ParseFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure::MissingSize);
    }
    let ungrouped = strip_grouping(trimmed);
    let value = match size_pattern().captures(&ungrouped) {
        Some(caps) => caps[1].parse::<f64>().ok(),
        None => ungrouped.parse::<f64>().ok(),
    };
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(ParseFailure::InvalidSize(trimmed.to_string())),
    }
}
