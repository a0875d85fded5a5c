//! Per-record request translation: resolve the listing, then fetch the
//! requested facets through the shared client.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::client::RateLimitedClient;
use crate::error::ServiceError;
use crate::record::{BusinessRecord, PlaceDetails, PlacePhoto};

/// Default number of photos kept per record.
pub const DEFAULT_MAX_IMAGES: usize = 3;

/// An independently fetchable slice of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    /// Address, contact, rating, location.
    Details,
    /// Ranked photo URLs.
    Images,
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facet::Details => f.write_str("details"),
            Facet::Images => f.write_str("images"),
        }
    }
}

/// Subset of `{details, images}` requested by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FacetSet {
    details: bool,
    images: bool,
}

impl FacetSet {
    /// Only the details facet.
    pub const DETAILS: FacetSet = FacetSet {
        details: true,
        images: false,
    };
    /// Only the images facet.
    pub const IMAGES: FacetSet = FacetSet {
        details: false,
        images: true,
    };
    /// Both facets.
    pub const ALL: FacetSet = FacetSet {
        details: true,
        images: true,
    };

    /// Whether `facet` is part of the set.
    pub fn contains(self, facet: Facet) -> bool {
        match facet {
            Facet::Details => self.details,
            Facet::Images => self.images,
        }
    }

    /// Facets in fetch order.
    pub fn iter(self) -> impl Iterator<Item = Facet> {
        [Facet::Details, Facet::Images]
            .into_iter()
            .filter(move |facet| self.contains(*facet))
    }
}

/// Result of one facet call.
pub type FacetResult<T> = Result<T, ServiceError>;

/// Facet results for a record whose listing reference is known.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFetch {
    /// Reference used for the facet calls.
    pub external_ref: String,
    /// True when the reference came from a resolution call in this run.
    pub freshly_resolved: bool,
    /// `None` when details were not requested.
    pub details: Option<FacetResult<PlaceDetails>>,
    /// Selected image URLs; `None` when images were not requested.
    pub images: Option<FacetResult<Vec<String>>>,
}

/// Everything the fetcher learned about one record.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The identity could not be mapped to a listing; no facet was attempted.
    Unresolved(ServiceError),
    /// The listing is addressable; facets carry their own results.
    Resolved(ResolvedFetch),
}

impl FetchOutcome {
    /// Result for `facet`, when it was requested and attempted.
    pub fn facet_error(&self, facet: Facet) -> Option<&ServiceError> {
        let Self::Resolved(fetch) = self else {
            return None;
        };
        match facet {
            Facet::Details => fetch.details.as_ref().and_then(|r| r.as_ref().err()),
            Facet::Images => fetch.images.as_ref().and_then(|r| r.as_ref().err()),
        }
    }
}

/// Stateless translator from a record snapshot to a [`FetchOutcome`].
#[derive(Clone)]
pub struct RecordFetcher {
    client: Arc<RateLimitedClient>,
    max_images: usize,
    force_resolve: bool,
}

impl RecordFetcher {
    /// Creates a fetcher keeping at most `max_images` photos per record.
    pub fn new(client: Arc<RateLimitedClient>, max_images: usize) -> Self {
        Self {
            client,
            max_images: max_images.max(1),
            force_resolve: false,
        }
    }

    /// Re-resolve listings even when a reference is cached.
    pub fn with_force_resolve(mut self, force: bool) -> Self {
        self.force_resolve = force;
        self
    }

    /// Shared client, exposed for cost reporting.
    pub fn client(&self) -> &Arc<RateLimitedClient> {
        &self.client
    }

    /// Resolves `record` if needed and fetches every requested facet.
    pub async fn fetch(&self, record: &BusinessRecord, facets: FacetSet) -> FetchOutcome {
        let cached = record
            .external_ref
            .as_deref()
            .filter(|r| !r.trim().is_empty());
        let (external_ref, freshly_resolved) = match cached {
            Some(existing) if !self.force_resolve => (existing.to_string(), false),
            _ => match self.client.resolve_place(&record.identity_hint()).await {
                Ok(resolved) => (resolved, true),
                Err(err) => {
                    debug!(id = %record.id, kind = %err.kind, "listing unresolved");
                    return FetchOutcome::Unresolved(err);
                }
            },
        };

        let mut fetch = ResolvedFetch {
            external_ref,
            freshly_resolved,
            details: None,
            images: None,
        };
        for facet in facets.iter() {
            match facet {
                Facet::Details => {
                    fetch.details = Some(self.client.fetch_details(&fetch.external_ref).await);
                }
                Facet::Images => {
                    let photos = self.client.fetch_photos(&fetch.external_ref).await;
                    fetch.images =
                        Some(photos.map(|photos| select_best_photos(photos, self.max_images)));
                }
            }
        }
        FetchOutcome::Resolved(fetch)
    }
}

/// Ranks photos by width (descending, stable on ties), drops empty and
/// duplicate URLs, and keeps the first `max_images`.
pub fn select_best_photos(mut photos: Vec<PlacePhoto>, max_images: usize) -> Vec<String> {
    photos.sort_by(|a, b| b.width.cmp(&a.width));
    let mut seen = HashSet::new();
    photos
        .into_iter()
        .map(|photo| photo.url)
        .filter(|url| !url.trim().is_empty())
        .filter(|url| seen.insert(url.clone()))
        .take(max_images)
        .collect()
}
