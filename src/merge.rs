//! Pure merge of fetched facets into a persisted record.

use chrono::{DateTime, Utc};

use crate::controls::SyncMode;
use crate::fetcher::{Facet, FetchOutcome};
use crate::record::{BusinessRecord, PlaceDetails};

/// Applies `outcome` to `existing` for the facets `mode` owns.
///
/// Facets that were not requested, or whose fetch failed, keep their value
/// and timestamp. A resolved reference is cached even if every facet failed.
pub fn merge(
    existing: &BusinessRecord,
    outcome: &FetchOutcome,
    mode: SyncMode,
    run_at: DateTime<Utc>,
) -> BusinessRecord {
    let mut merged = existing.clone();
    let FetchOutcome::Resolved(fetch) = outcome else {
        return merged;
    };
    merged.external_ref = Some(fetch.external_ref.clone());

    let facets = mode.plan().facets;
    if facets.contains(Facet::Details) {
        if let Some(Ok(details)) = &fetch.details {
            apply_details(&mut merged, details);
            merged.last_updated.data_updated_at = Some(run_at);
        }
    }
    if facets.contains(Facet::Images) {
        if let Some(Ok(images)) = &fetch.images {
            merged.images = images.clone();
            merged.last_updated.images_updated_at = Some(run_at);
        }
    }
    merged
}

fn apply_details(record: &mut BusinessRecord, details: &PlaceDetails) {
    record.address = details.address.clone();
    record.contact_info.phone = details.phone.clone();
    record.contact_info.website = details.website.clone();
    record.rating = details.rating;
    record.user_ratings_total = details.user_ratings_total;
    record.place_types = details.place_types.clone();
    // coordinates set by the canonical import are never moved
    if record.location.is_none() {
        record.location = details.location.clone();
    }
}
