//! Reconciles one category's freshly fetched batch against the listing and history stores.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use okiprop_core::{ListingDraft, ListingId, RawListing};
use okiprop_storage::{PropertyStore, StorageError, StoreTransaction, UpsertOutcome};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error)]
#[error("storage failure while reconciling {category}: {source}")]
pub struct ReconcileError {
    pub category: String,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceChange {
    pub listing_id: ListingId,
    pub title: String,
    pub previous_price: i64,
    pub price: i64,
}

/// Counts and price changes produced by reconciling one category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub category: String,
    pub fetched: usize,
    pub valid: usize,
    pub parse_failures: usize,
    /// Valid entries that resolved to a listing already handled in the same batch.
    pub duplicates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub history_appended: usize,
    pub price_changes: Vec<PriceChange>,
}

impl ReconcileOutcome {
    /// Listings inserted or refreshed by this batch.
    pub fn touched(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn price_changed_titles(&self) -> Vec<&str> {
        self.price_changes.iter().map(|c| c.title.as_str()).collect()
    }
}

/// Applies fetched batches to the store. Each call is one transaction: upserts, deactivation
/// and history points for a category commit together or not at all.
pub struct Reconciler<'a> {
    store: &'a PropertyStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a PropertyStore) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        category: &str,
        batch: &[RawListing],
        run_date: NaiveDate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let span = info_span!("reconcile", category, %run_date);
        self.reconcile_inner(category, batch, run_date)
            .instrument(span)
            .await
            .map_err(|source| ReconcileError {
                category: category.to_string(),
                source,
            })
    }

    async fn reconcile_inner(
        &self,
        category: &str,
        batch: &[RawListing],
        run_date: NaiveDate,
    ) -> Result<ReconcileOutcome, StorageError> {
        let mut outcome = ReconcileOutcome {
            category: category.to_string(),
            fetched: batch.len(),
            ..Default::default()
        };

        let mut drafts = Vec::with_capacity(batch.len());
        for (index, raw) in batch.iter().enumerate() {
            match raw.validate(category) {
                Ok(draft) => drafts.push(draft),
                Err(failure) => {
                    outcome.parse_failures += 1;
                    warn!(index, title = %raw.title, error = %failure, "skipping unparsable listing");
                }
            }
        }
        outcome.valid = drafts.len();

        let mut tx = self.store.begin().await?;
        let ids = resolve_identities(&mut tx, &drafts).await?;

        let mut seen: HashSet<ListingId> = HashSet::with_capacity(drafts.len());
        let mut observed: Vec<(ListingId, i64)> = Vec::with_capacity(drafts.len());
        for (draft, id) in drafts.iter().zip(ids) {
            if !seen.insert(id.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            match tx.upsert(&id, draft, run_date).await? {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::Updated {
                    previous_price,
                    price_changed,
                    reactivated,
                } => {
                    outcome.updated += 1;
                    if reactivated {
                        outcome.reactivated += 1;
                    }
                    if price_changed {
                        info!(
                            title = %draft.title,
                            previous_price,
                            price = draft.price,
                            "price changed"
                        );
                        outcome.price_changes.push(PriceChange {
                            listing_id: id.clone(),
                            title: draft.title.clone(),
                            previous_price,
                            price: draft.price,
                        });
                    }
                }
            }
            observed.push((id, draft.price));
        }

        outcome.deactivated = tx.deactivate_missing(category, &seen, run_date).await?.len();

        for (id, price) in &observed {
            if tx.append_history_if_absent(id, run_date, *price).await? {
                outcome.history_appended += 1;
            }
        }

        tx.commit().await?;

        info!(
            fetched = outcome.fetched,
            valid = outcome.valid,
            parse_failures = outcome.parse_failures,
            inserted = outcome.inserted,
            updated = outcome.updated,
            reactivated = outcome.reactivated,
            deactivated = outcome.deactivated,
            price_changes = outcome.price_changes.len(),
            "category reconciled"
        );
        Ok(outcome)
    }
}

/// Map each draft to the listing it observes.
///
/// A draft whose content id already exists is that listing. Otherwise it continues an
/// existing listing of the same category, title and location (compatible url, not already
/// claimed by this batch) when exactly one such row exists, or exactly one of several has the
/// same size. Anything else is a new listing under its content id.
async fn resolve_identities(
    tx: &mut StoreTransaction,
    drafts: &[ListingDraft],
) -> Result<Vec<ListingId>, StorageError> {
    let mut resolved: Vec<Option<ListingId>> = Vec::with_capacity(drafts.len());
    let mut claimed: HashSet<ListingId> = HashSet::new();

    for draft in drafts {
        let id = draft.identity();
        if tx.get(&id).await?.is_some() {
            claimed.insert(id.clone());
            resolved.push(Some(id));
        } else {
            resolved.push(None);
        }
    }

    let mut carried: HashMap<ListingId, ListingId> = HashMap::new();
    for (draft, slot) in drafts.iter().zip(resolved.iter_mut()) {
        if slot.is_some() {
            continue;
        }
        let fresh = draft.identity();
        if let Some(existing) = carried.get(&fresh) {
            *slot = Some(existing.clone());
            continue;
        }

        let candidates: Vec<_> = tx
            .find_lineage(&draft.property_type, &draft.title, &draft.location)
            .await?
            .into_iter()
            .filter(|row| !claimed.contains(&row.id))
            .filter(|row| row.url.is_empty() || draft.url.is_empty() || row.url == draft.url)
            .collect();

        let predecessor = match candidates.as_slice() {
            [] => None,
            [only] => Some(only.id.clone()),
            many => {
                let same_size: Vec<_> = many.iter().filter(|row| row.size == draft.size).collect();
                match same_size.as_slice() {
                    [only] => Some(only.id.clone()),
                    _ => None,
                }
            }
        };

        let id = match predecessor {
            Some(id) => {
                claimed.insert(id.clone());
                id
            }
            None => fresh.clone(),
        };
        carried.insert(fresh, id.clone());
        *slot = Some(id);
    }

    Ok(resolved.into_iter().flatten().collect())
}
