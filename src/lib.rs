#![warn(missing_docs)]
//! Core library entry points for the farmsync listing enrichment pipeline.

pub mod client;
pub mod controls;
pub mod error;
pub mod fetcher;
pub mod merge;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod store;

pub use client::{GooglePlacesApi, PlacesApi, RateLimitedClient, RetryPolicy};
pub use controls::{Cli, ModePlan, SyncControls, SyncMode};
pub use error::{FailureKind, RunFailure, ServiceError, SyncError};
pub use fetcher::{Facet, FacetSet, FetchOutcome, RecordFetcher};
pub use merge::merge;
pub use pipeline::{RunState, SyncPipeline};
pub use record::{BusinessRecord, ContactInfo, Coordinates, FacetTimestamps};
pub use report::{IssueKind, RecordIssue, RunReport};
