//! Append-only price history.

use chrono::NaiveDate;
use okiprop_core::{HistoryPoint, ListingId};
use sqlx::{Row, SqliteConnection};

use crate::StorageResult;

/// Insert a point unless one already exists for (listing, date). Returns whether a row was written.
pub(crate) async fn append_if_absent(
    conn: &mut SqliteConnection,
    listing_id: &ListingId,
    date: NaiveDate,
    price: i64,
) -> StorageResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO price_history (listing_id, observed_on, price)
        VALUES (?, ?, ?)
        ON CONFLICT (listing_id, observed_on) DO NOTHING
        "#,
    )
    .bind(listing_id.as_str())
    .bind(date)
    .bind(price)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn query_by_listing(
    conn: &mut SqliteConnection,
    listing_id: &ListingId,
) -> StorageResult<Vec<HistoryPoint>> {
    let rows = sqlx::query(
        "SELECT listing_id, observed_on, price FROM price_history WHERE listing_id = ? ORDER BY observed_on ASC",
    )
    .bind(listing_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(HistoryPoint {
                listing_id: ListingId::from_stored(row.try_get::<String, _>("listing_id")?),
                date: row.try_get("observed_on")?,
                price: row.try_get("price")?,
            })
        })
        .collect()
}
