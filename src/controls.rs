//! Run modes and the tunable knobs that bound a sync run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::client::google::{GooglePlacesApi, DEFAULT_API_BASE};
use crate::client::RetryPolicy;
use crate::error::SyncError;
use crate::fetcher::{FacetSet, DEFAULT_MAX_IMAGES};

/// Operation selected for a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum SyncMode {
    /// Refresh the details facet; creates the baseline.
    #[value(name = "data-only")]
    #[serde(rename = "data-only")]
    DataOnly,
    /// Refresh images on an existing baseline.
    #[value(name = "images-only")]
    #[serde(rename = "images-only")]
    ImagesOnly,
    /// Refresh both facets.
    #[value(name = "data+images")]
    #[serde(rename = "data+images")]
    DataAndImages,
    /// Re-fetch details for an existing baseline.
    #[value(name = "update-data")]
    #[serde(rename = "update-data")]
    UpdateData,
}

/// What a mode fetches and what it expects on disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModePlan {
    /// Facets fetched and merged.
    pub facets: FacetSet,
    /// Whether the dataset must already exist.
    pub requires_baseline: bool,
}

impl SyncMode {
    /// Every accepted mode.
    pub const ALL: [SyncMode; 4] = [
        SyncMode::DataOnly,
        SyncMode::ImagesOnly,
        SyncMode::DataAndImages,
        SyncMode::UpdateData,
    ];

    /// Facets and baseline requirement for this mode.
    pub fn plan(self) -> ModePlan {
        match self {
            SyncMode::DataOnly => ModePlan {
                facets: FacetSet::DETAILS,
                requires_baseline: false,
            },
            SyncMode::ImagesOnly => ModePlan {
                facets: FacetSet::IMAGES,
                requires_baseline: true,
            },
            SyncMode::DataAndImages => ModePlan {
                facets: FacetSet::ALL,
                requires_baseline: false,
            },
            SyncMode::UpdateData => ModePlan {
                facets: FacetSet::DETAILS,
                requires_baseline: true,
            },
        }
    }

    /// Command-line spelling of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::DataOnly => "data-only",
            SyncMode::ImagesOnly => "images-only",
            SyncMode::DataAndImages => "data+images",
            SyncMode::UpdateData => "update-data",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim();
        SyncMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| {
                SyncError::Configuration(format!(
                    "unknown mode {value:?}; expected one of data-only, images-only, data+images, update-data"
                ))
            })
    }
}

/// Immutable knobs for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncControls {
    mode: SyncMode,
    dataset_path: PathBuf,
    geo_path: PathBuf,
    import_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    retry_from: Option<PathBuf>,
    qps: f64,
    retry: RetryPolicy,
    max_images: usize,
    workers: usize,
    force_resolve: bool,
    refresh_images: bool,
    limit: Option<usize>,
    dry_run: bool,
}

impl SyncControls {
    /// Controls for `mode` with default paths and limits.
    pub fn new(mode: SyncMode, dataset_path: impl Into<PathBuf>, geo_path: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            dataset_path: dataset_path.into(),
            geo_path: geo_path.into(),
            import_path: None,
            report_path: None,
            retry_from: None,
            qps: 5.0,
            retry: RetryPolicy::default(),
            max_images: DEFAULT_MAX_IMAGES,
            workers: 1,
            force_resolve: false,
            refresh_images: false,
            limit: None,
            dry_run: false,
        }
    }

    /// Upstream import used when a baseline mode finds no dataset.
    pub fn with_import(mut self, path: impl Into<PathBuf>) -> Self {
        self.import_path = Some(path.into());
        self
    }

    /// Where the JSON run report is written.
    pub fn with_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Restricts the run to the issues listed in a previous report.
    pub fn with_retry_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.retry_from = Some(path.into());
        self
    }

    /// Outbound request ceiling.
    pub fn with_qps(mut self, qps: f64) -> Self {
        self.qps = qps;
        self
    }

    /// Backoff policy for transient failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-record image cap.
    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    /// Record tasks allowed in flight.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Re-resolve cached references.
    pub fn with_force_resolve(mut self, force: bool) -> Self {
        self.force_resolve = force;
        self
    }

    /// Refetch images for records that already have some.
    pub fn with_refresh_images(mut self, refresh: bool) -> Self {
        self.refresh_images = refresh;
        self
    }

    /// Process at most `limit` selected records.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Skip the write phase.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Selected mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Dataset read and rewritten by the run.
    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    /// Geo projection output.
    pub fn geo_path(&self) -> &Path {
        &self.geo_path
    }

    /// Optional upstream import.
    pub fn import_path(&self) -> Option<&Path> {
        self.import_path.as_deref()
    }

    /// Optional report output.
    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    /// Optional previous report driving a targeted retry.
    pub fn retry_from(&self) -> Option<&Path> {
        self.retry_from.as_deref()
    }

    /// Outbound request ceiling.
    pub fn qps(&self) -> f64 {
        self.qps
    }

    /// Backoff policy.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Per-record image cap.
    pub fn max_images(&self) -> usize {
        self.max_images
    }

    /// Worker pool size.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether cached references are ignored.
    pub fn force_resolve(&self) -> bool {
        self.force_resolve
    }

    /// Whether records with images are refetched in images-only runs.
    pub fn refresh_images(&self) -> bool {
        self.refresh_images
    }

    /// Cap on processed records.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Whether writes are skipped.
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Rejects values that would make the run meaningless.
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(SyncError::Configuration(format!(
                "qps must be a positive number, got {}",
                self.qps
            )));
        }
        if self.max_images == 0 {
            return Err(SyncError::Configuration(
                "max images must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts() == 0 {
            return Err(SyncError::Configuration(
                "max retries must allow at least 1 attempt".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(SyncError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.dataset_path == self.geo_path {
            return Err(SyncError::Configuration(
                "dataset and geo output must be different files".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncControls {
    fn default() -> Self {
        Self::new(
            SyncMode::DataOnly,
            "data/farms.uk.json",
            "data/farms.geo.json",
        )
    }
}

/// Command-line interface for the sync binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "farmsync", about = "Enrich farm shop listings from the places directory")]
pub struct Cli {
    /// Operation to run
    #[arg(long, env = "FARMSYNC_MODE", value_enum)]
    pub mode: SyncMode,

    /// Dataset JSON read and rewritten by the run
    #[arg(long, env = "FARMSYNC_DATASET", default_value = "data/farms.uk.json")]
    pub dataset: PathBuf,

    /// Derived geo projection output
    #[arg(long, env = "FARMSYNC_GEO_OUTPUT", default_value = "data/farms.geo.json")]
    pub geo_output: PathBuf,

    /// Upstream import used when data-only/data+images finds no dataset
    #[arg(long = "import", env = "FARMSYNC_IMPORT")]
    pub import: Option<PathBuf>,

    /// Optional JSON run report path
    #[arg(long, env = "FARMSYNC_REPORT")]
    pub report: Option<PathBuf>,

    /// Places directory API key
    #[arg(long, env = "GOOGLE_PLACES_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Places web service root
    #[arg(long, env = "FARMSYNC_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Outbound queries per second shared by all workers
    #[arg(long, env = "FARMSYNC_QPS", default_value_t = 5.0)]
    pub qps: f64,

    /// Attempts per call for rate limits or transient errors
    #[arg(long, env = "FARMSYNC_MAX_RETRIES", default_value_t = 4)]
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled per retry
    #[arg(long, env = "FARMSYNC_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    /// Images kept per record
    #[arg(long, env = "FARMSYNC_MAX_IMAGES", default_value_t = DEFAULT_MAX_IMAGES)]
    pub max_images: usize,

    /// Width requested for photo URLs
    #[arg(long, env = "FARMSYNC_PHOTO_MAX_WIDTH", default_value_t = 800)]
    pub photo_max_width: u32,

    /// Location bias radius for place resolution, in metres
    #[arg(long, env = "FARMSYNC_SEARCH_RADIUS_M", default_value_t = 2000)]
    pub search_radius_m: u32,

    /// Records processed concurrently
    #[arg(long, env = "FARMSYNC_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "FARMSYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Re-resolve listings even when a reference is cached
    #[arg(long, default_value_t = false)]
    pub force_resolve: bool,

    /// Refetch images for records that already have them
    #[arg(long, default_value_t = false)]
    pub refresh_images: bool,

    /// Only process records listed as issues in this previous report
    #[arg(long)]
    pub retry_from: Option<PathBuf>,

    /// Process at most this many records
    #[arg(long)]
    pub limit: Option<usize>,

    /// Fetch and merge but write nothing except the report
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

impl Cli {
    /// Converts the parsed CLI into `SyncControls`.
    pub fn build_controls(&self) -> SyncControls {
        let base = Duration::from_millis(self.backoff_ms);
        let mut controls = SyncControls::new(self.mode, &self.dataset, &self.geo_output)
            .with_qps(self.qps)
            .with_retry(RetryPolicy::new(self.max_retries, base, base.saturating_mul(16)))
            .with_max_images(self.max_images)
            .with_workers(self.workers)
            .with_force_resolve(self.force_resolve)
            .with_refresh_images(self.refresh_images)
            .with_limit(self.limit)
            .with_dry_run(self.dry_run);
        if let Some(path) = &self.import {
            controls = controls.with_import(path);
        }
        if let Some(path) = &self.report {
            controls = controls.with_report(path);
        }
        if let Some(path) = &self.retry_from {
            controls = controls.with_retry_from(path);
        }
        controls
    }

    /// Builds the directory transport; fails before any network call when
    /// the credential is missing.
    pub fn places_api(&self) -> Result<GooglePlacesApi, SyncError> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                SyncError::Configuration(
                    "missing places API key (set GOOGLE_PLACES_API_KEY or --api-key)".to_string(),
                )
            })?;
        GooglePlacesApi::new(
            api_key.to_string(),
            &self.api_base,
            Duration::from_secs(self.timeout_secs.max(1)),
            self.search_radius_m,
            self.photo_max_width,
        )
        .map_err(|err| SyncError::Configuration(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_to_facet_plans() {
        assert_eq!(SyncMode::DataOnly.plan().facets, FacetSet::DETAILS);
        assert!(!SyncMode::DataOnly.plan().requires_baseline);
        assert_eq!(SyncMode::ImagesOnly.plan().facets, FacetSet::IMAGES);
        assert!(SyncMode::ImagesOnly.plan().requires_baseline);
        assert_eq!(SyncMode::DataAndImages.plan().facets, FacetSet::ALL);
        assert_eq!(SyncMode::UpdateData.plan().facets, FacetSet::DETAILS);
        assert!(SyncMode::UpdateData.plan().requires_baseline);
    }

    #[test]
    fn mode_strings_round_trip() {
        for mode in SyncMode::ALL {
            assert_eq!(mode.as_str().parse::<SyncMode>().unwrap(), mode);
        }
        assert!(matches!(
            "images".parse::<SyncMode>(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn cli_parses_plus_mode_and_flags() {
        let cli = Cli::try_parse_from([
            "farmsync",
            "--mode",
            "data+images",
            "--api-key",
            "k",
            "--qps",
            "2.5",
            "--workers",
            "3",
            "--limit",
            "10",
        ])
        .expect("valid args");
        let controls = cli.build_controls();
        assert_eq!(controls.mode(), SyncMode::DataAndImages);
        assert_eq!(controls.qps(), 2.5);
        assert_eq!(controls.workers(), 3);
        assert_eq!(controls.limit(), Some(10));
        assert!(controls.validate().is_ok());
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        for key in ["", "   "] {
            let cli = Cli::try_parse_from(["farmsync", "--mode", "data-only", "--api-key", key])
                .expect("valid args");
            assert!(matches!(cli.places_api(), Err(SyncError::Configuration(_))));
        }

        let mut cli = Cli::try_parse_from(["farmsync", "--mode", "data-only", "--api-key", "k"])
            .expect("valid args");
        cli.api_key = None;
        assert!(matches!(cli.places_api(), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn zero_retries_are_rejected() {
        let cli = Cli::try_parse_from(["farmsync", "--mode", "data-only", "--max-retries", "0"])
            .expect("valid args");
        assert!(matches!(
            cli.build_controls().validate(),
            Err(SyncError::Configuration(ref msg)) if msg.contains("retries")
        ));
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let backoff = u64::MAX.to_string();
        let cli = Cli::try_parse_from([
            "farmsync",
            "--mode",
            "data-only",
            "--backoff-ms",
            backoff.as_str(),
        ])
        .expect("valid args");
        let retry = cli.build_controls().retry();
        assert_eq!(retry.next_delay(1), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn invalid_controls_are_rejected() {
        let base = SyncControls::new(SyncMode::DataOnly, "a.json", "b.json");
        assert!(base.clone().with_qps(0.0).validate().is_err());
        assert!(base.clone().with_max_images(0).validate().is_err());
        assert!(base.clone().with_workers(0).validate().is_err());
        assert!(SyncControls::new(SyncMode::DataOnly, "a.json", "a.json")
            .validate()
            .is_err());
    }
}
