//! Listing table queries. Every function runs on a caller-provided connection so the same
//! statements serve both pooled reads and per-category transactions.

use std::collections::HashSet;

use chrono::NaiveDate;
use okiprop_core::{Listing, ListingDraft, ListingId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::StorageResult;

const SELECT_COLUMNS: &str = "SELECT id, title, price, size, location, url, building_name, madori, \
     chikunensu, property_type, first_seen, last_seen, is_active FROM listings";

/// What `upsert` did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated {
        previous_price: i64,
        price_changed: bool,
        reactivated: bool,
    },
}

fn listing_from_row(row: &SqliteRow) -> StorageResult<Listing> {
    let id: String = row.try_get("id")?;
    Ok(Listing {
        id: ListingId::from_stored(id),
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        size: row.try_get("size")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        building_name: row.try_get("building_name")?,
        madori: row.try_get("madori")?,
        chikunensu: row.try_get("chikunensu")?,
        property_type: row.try_get("property_type")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        is_active: row.try_get("is_active")?,
    })
}

fn listings_from_rows(rows: &[SqliteRow]) -> StorageResult<Vec<Listing>> {
    rows.iter().map(listing_from_row).collect()
}

pub(crate) async fn get(conn: &mut SqliteConnection, id: &ListingId) -> StorageResult<Option<Listing>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(listing_from_row).transpose()
}

/// Insert a first observation, or refresh price/size/last_seen on an existing id and
/// reactivate it. Descriptive fields are only filled in where previously missing.
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    id: &ListingId,
    draft: &ListingDraft,
    observed_on: NaiveDate,
) -> StorageResult<UpsertOutcome> {
    let existing = sqlx::query("SELECT price, is_active FROM listings WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    let Some(existing) = existing else {
        sqlx::query(
            r#"
            INSERT INTO listings (
                id, title, price, size, location, url, building_name, madori, chikunensu,
                property_type, first_seen, last_seen, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(id.as_str())
        .bind(&draft.title)
        .bind(draft.price)
        .bind(draft.size)
        .bind(&draft.location)
        .bind(&draft.url)
        .bind(draft.building_name.as_deref())
        .bind(draft.madori.as_deref())
        .bind(draft.chikunensu.as_deref())
        .bind(&draft.property_type)
        .bind(observed_on)
        .bind(observed_on)
        .execute(&mut *conn)
        .await?;
        return Ok(UpsertOutcome::Inserted);
    };

    let previous_price: i64 = existing.try_get("price")?;
    let was_active: bool = existing.try_get("is_active")?;

    sqlx::query(
        r#"
        UPDATE listings
        SET price = ?,
            size = ?,
            last_seen = MAX(last_seen, ?),
            is_active = 1,
            building_name = COALESCE(building_name, ?),
            madori = COALESCE(madori, ?),
            chikunensu = COALESCE(chikunensu, ?)
        WHERE id = ?
        "#,
    )
    .bind(draft.price)
    .bind(draft.size)
    .bind(observed_on)
    .bind(draft.building_name.as_deref())
    .bind(draft.madori.as_deref())
    .bind(draft.chikunensu.as_deref())
    .bind(id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(UpsertOutcome::Updated {
        previous_price,
        price_changed: previous_price != draft.price,
        reactivated: !was_active,
    })
}

/// Mark every active listing of `property_type` that is not in `seen` as inactive.
/// `last_seen` keeps the date the listing was last actually observed. Rows observed after
/// `as_of` are left alone.
pub(crate) async fn deactivate_missing(
    conn: &mut SqliteConnection,
    property_type: &str,
    seen: &HashSet<ListingId>,
    as_of: NaiveDate,
) -> StorageResult<Vec<ListingId>> {
    let rows = sqlx::query(
        "SELECT id FROM listings WHERE property_type = ? AND is_active = 1 AND last_seen <= ? ORDER BY id",
    )
    .bind(property_type)
    .bind(as_of)
    .fetch_all(&mut *conn)
    .await?;

    let mut deactivated = Vec::new();
    for row in rows {
        let id = ListingId::from_stored(row.try_get::<String, _>("id")?);
        if seen.contains(&id) {
            continue;
        }
        sqlx::query("UPDATE listings SET is_active = 0 WHERE id = ? AND property_type = ?")
            .bind(id.as_str())
            .bind(property_type)
            .execute(&mut *conn)
            .await?;
        deactivated.push(id);
    }
    Ok(deactivated)
}

/// Rows of the same category sharing title and location, used to carry an identity across
/// price or size changes.
pub(crate) async fn find_lineage(
    conn: &mut SqliteConnection,
    property_type: &str,
    title: &str,
    location: &str,
) -> StorageResult<Vec<Listing>> {
    let sql = format!(
        "{SELECT_COLUMNS} WHERE property_type = ? AND title = ? AND location = ? ORDER BY first_seen, id"
    );
    let rows = sqlx::query(&sql)
        .bind(property_type)
        .bind(title)
        .bind(location)
        .fetch_all(&mut *conn)
        .await?;
    listings_from_rows(&rows)
}

/// Active rows cheapest first; inactive rows most recently seen first.
pub(crate) async fn list_by_activity(conn: &mut SqliteConnection, active: bool) -> StorageResult<Vec<Listing>> {
    let order = if active {
        "price ASC, id ASC"
    } else {
        "last_seen DESC, id ASC"
    };
    let sql = format!("{SELECT_COLUMNS} WHERE is_active = ? ORDER BY {order}");
    let rows = sqlx::query(&sql)
        .bind(active)
        .fetch_all(&mut *conn)
        .await?;
    listings_from_rows(&rows)
}

pub(crate) async fn list_active_by_type(
    conn: &mut SqliteConnection,
    property_type: &str,
) -> StorageResult<Vec<Listing>> {
    let sql = format!(
        "{SELECT_COLUMNS} WHERE is_active = 1 AND property_type = ? ORDER BY price ASC, id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(property_type)
        .fetch_all(&mut *conn)
        .await?;
    listings_from_rows(&rows)
}

pub(crate) async fn list_first_seen_on(
    conn: &mut SqliteConnection,
    date: NaiveDate,
) -> StorageResult<Vec<Listing>> {
    let sql = format!("{SELECT_COLUMNS} WHERE first_seen = ? ORDER BY price ASC, id ASC");
    let rows = sqlx::query(&sql)
        .bind(date)
        .fetch_all(&mut *conn)
        .await?;
    listings_from_rows(&rows)
}
