//! Content-addressed listing identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest identifying a listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    /// Wrap an id read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ListingId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the id of a listing from its five identity fields.
///
/// Each field is fed to the digest as an 8-byte little-endian length followed by its UTF-8
/// bytes, so no two distinct field tuples share an encoding.
pub fn identify(title: &str, price: i64, size: f64, location: &str, property_type: &str) -> ListingId {
    let price = price.to_string();
    let size = size.to_string();
    let mut hasher = Sha256::new();
    for field in [title, price.as_str(), size.as_str(), location, property_type] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    ListingId(hex::encode(hasher.finalize()))
}
