//! SQLite listing/history stores, atomic report artifacts and HTTP fetch utilities for okiprop.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::NaiveDate;
use okiprop_core::{HistoryPoint, Listing, ListingDraft, ListingId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

mod artifacts;
mod history;
mod http;
mod listings;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use http::{FetchError, FetchedPage, HttpClientConfig, HttpFetcher};
pub use listings::UpsertOutcome;

pub const CRATE_NAME: &str = "okiprop-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Handle over the listing and price-history tables. Opened once per cycle and passed to
/// whatever needs to read or write them.
#[derive(Debug, Clone)]
pub struct PropertyStore {
    pool: SqlitePool,
}

impl PropertyStore {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn open(database_url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // One connection: writes are serialized, and an in-memory database lives exactly as
        // long as that connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> StorageResult<Self> {
        Self::open("sqlite::memory:").await
    }

    pub async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Start a write transaction. Dropping it without `commit` rolls everything back.
    pub async fn begin(&self) -> StorageResult<StoreTransaction> {
        Ok(StoreTransaction {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn get(&self, id: &ListingId) -> StorageResult<Option<Listing>> {
        let mut conn = self.pool.acquire().await?;
        listings::get(&mut conn, id).await
    }

    /// Active listings, cheapest first.
    pub async fn list_active(&self) -> StorageResult<Vec<Listing>> {
        let mut conn = self.pool.acquire().await?;
        listings::list_by_activity(&mut conn, true).await
    }

    /// Soft-deleted listings, most recently seen first.
    pub async fn list_inactive(&self) -> StorageResult<Vec<Listing>> {
        let mut conn = self.pool.acquire().await?;
        listings::list_by_activity(&mut conn, false).await
    }

    pub async fn list_active_by_type(&self, property_type: &str) -> StorageResult<Vec<Listing>> {
        let mut conn = self.pool.acquire().await?;
        listings::list_active_by_type(&mut conn, property_type).await
    }

    /// Listings whose first observation happened on `date`.
    pub async fn list_first_seen_on(&self, date: NaiveDate) -> StorageResult<Vec<Listing>> {
        let mut conn = self.pool.acquire().await?;
        listings::list_first_seen_on(&mut conn, date).await
    }

    /// Price history of one listing, oldest first.
    pub async fn history_for(&self, listing_id: &ListingId) -> StorageResult<Vec<HistoryPoint>> {
        let mut conn = self.pool.acquire().await?;
        history::query_by_listing(&mut conn, listing_id).await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// All writes of one category's reconciliation. Either everything commits or nothing does.
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    pub async fn get(&mut self, id: &ListingId) -> StorageResult<Option<Listing>> {
        listings::get(&mut self.tx, id).await
    }

    pub async fn upsert(
        &mut self,
        id: &ListingId,
        draft: &ListingDraft,
        observed_on: NaiveDate,
    ) -> StorageResult<UpsertOutcome> {
        listings::upsert(&mut self.tx, id, draft, observed_on).await
    }

    /// Deactivate active listings of `property_type` absent from `seen`. Returns the ids
    /// that were deactivated.
    pub async fn deactivate_missing(
        &mut self,
        property_type: &str,
        seen: &HashSet<ListingId>,
        as_of: NaiveDate,
    ) -> StorageResult<Vec<ListingId>> {
        let deactivated = listings::deactivate_missing(&mut self.tx, property_type, seen, as_of).await?;
        debug!(property_type, count = deactivated.len(), %as_of, "deactivated missing listings");
        Ok(deactivated)
    }

    pub async fn find_lineage(
        &mut self,
        property_type: &str,
        title: &str,
        location: &str,
    ) -> StorageResult<Vec<Listing>> {
        listings::find_lineage(&mut self.tx, property_type, title, location).await
    }

    pub async fn append_history_if_absent(
        &mut self,
        listing_id: &ListingId,
        date: NaiveDate,
        price: i64,
    ) -> StorageResult<bool> {
        history::append_if_absent(&mut self.tx, listing_id, date, price).await
    }

    pub async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
