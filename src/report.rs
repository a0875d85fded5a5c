//! Per-run outcome aggregation and the human-readable summary.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::CostSnapshot;
use crate::controls::SyncMode;
use crate::error::{FailureKind, ServiceError, SyncError};
use crate::fetcher::{FacetResult, FetchOutcome};
use crate::pipeline::RunState;
use crate::record::BusinessRecord;

/// Success/failure tally for one facet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCounts {
    /// Facet fetched and merged.
    pub succeeded: usize,
    /// Facet attempted but failed.
    pub failed: usize,
}

/// Why a record shows up in [`RunReport::issues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The identity could not be resolved to a listing.
    Unresolved,
    /// The details facet failed.
    DetailsFailed,
    /// The images facet failed.
    ImagesFailed,
    /// The record task panicked; the record was kept unchanged.
    Panicked,
}

impl IssueKind {
    fn label(self) -> &'static str {
        match self {
            IssueKind::Unresolved => "unresolved",
            IssueKind::DetailsFailed => "details failed",
            IssueKind::ImagesFailed => "images failed",
            IssueKind::Panicked => "panicked",
        }
    }
}

/// A record with a non-success outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordIssue {
    /// Record id.
    pub id: String,
    /// Record name, for operators.
    pub name: String,
    /// What went wrong.
    pub issue: IssueKind,
    /// Service failure class, when the issue came from a directory call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Detail message.
    pub message: String,
}

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Mode the run executed.
    pub mode: SyncMode,
    /// Final state.
    pub state: RunState,
    /// When the run entered `Init`.
    pub started_at: DateTime<Utc>,
    /// When the run reached `Done`.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the write phase was skipped.
    #[serde(default)]
    pub dry_run: bool,
    /// Whether a stop request cut the run short.
    #[serde(default)]
    pub interrupted: bool,
    /// Records in the loaded dataset.
    pub total_records: usize,
    /// Records handed to the fetcher.
    pub attempted: usize,
    /// Attempted records with every requested facet merged.
    pub succeeded: usize,
    /// Records skipped by the selection policy.
    pub skipped: usize,
    /// Records never started because of a stop request.
    pub not_started: usize,
    /// Records whose identity could not be resolved.
    pub unresolved: usize,
    /// References resolved during this run.
    pub newly_resolved: usize,
    /// Details facet tally.
    pub details: FacetCounts,
    /// Images facet tally.
    pub images: FacetCounts,
    /// Record tasks that panicked.
    pub panicked: usize,
    /// Records whose stored images were cut back to the per-record bound.
    #[serde(default)]
    pub images_trimmed: usize,
    /// Directory calls and estimated spend.
    pub cost: CostSnapshot,
    /// CRC32 of the dataset written, when the write phase ran.
    #[serde(default)]
    pub dataset_checksum: Option<u32>,
    /// Whether the written dataset differs from the file it replaced.
    #[serde(default)]
    pub dataset_changed: bool,
    /// Every non-success record outcome.
    #[serde(default)]
    pub issues: Vec<RecordIssue>,
}

impl RunReport {
    /// Empty report for a run that starts at `started_at`.
    pub fn new(mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            state: RunState::Init,
            started_at,
            finished_at: None,
            dry_run: false,
            interrupted: false,
            total_records: 0,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            not_started: 0,
            unresolved: 0,
            newly_resolved: 0,
            details: FacetCounts::default(),
            images: FacetCounts::default(),
            panicked: 0,
            images_trimmed: 0,
            cost: CostSnapshot::default(),
            dataset_checksum: None,
            dataset_changed: false,
            issues: Vec::new(),
        }
    }

    /// Folds in the fetch outcome for an attempted record.
    pub fn record_outcome(&mut self, record: &BusinessRecord, outcome: &FetchOutcome) {
        self.attempted += 1;
        let fetch = match outcome {
            FetchOutcome::Unresolved(err) => {
                self.unresolved += 1;
                self.push_service_issue(record, IssueKind::Unresolved, err);
                return;
            }
            FetchOutcome::Resolved(fetch) => fetch,
        };
        if fetch.freshly_resolved {
            self.newly_resolved += 1;
        }
        let details_ok = self.tally(record, &fetch.details, IssueKind::DetailsFailed);
        let images_ok = self.tally(record, &fetch.images, IssueKind::ImagesFailed);
        if details_ok && images_ok {
            self.succeeded += 1;
        }
    }

    /// Counts a record left alone by the selection policy.
    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Counts a record never started because the run was stopped.
    pub fn record_not_started(&mut self) {
        self.not_started += 1;
        self.interrupted = true;
    }

    /// Counts a record whose task panicked.
    pub fn record_panic(&mut self, record: &BusinessRecord, message: impl Into<String>) {
        self.attempted += 1;
        self.panicked += 1;
        let message = message.into();
        warn!(id = %record.id, %message, "record task panicked; keeping record unchanged");
        self.issues.push(RecordIssue {
            id: record.id.clone(),
            name: record.name.clone(),
            issue: IssueKind::Panicked,
            failure: None,
            message,
        });
    }

    /// Stores the checksum of the written dataset.
    pub fn record_write(&mut self, checksum: u32, previous: Option<u32>) {
        self.dataset_checksum = Some(checksum);
        self.dataset_changed = previous != Some(checksum);
    }

    /// Ids listed in `issues`, for a targeted retry.
    pub fn issue_ids(&self) -> HashSet<String> {
        self.issues.iter().map(|issue| issue.id.clone()).collect()
    }

    /// Reads a report written by an earlier run.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let bytes = fs::read(path).map_err(|err| SyncError::persistence(path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| {
            SyncError::Configuration(format!("cannot read retry report {path:?}: {err}"))
        })
    }

    /// Multi-line operator summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let elapsed = self
            .finished_at
            .map(|done| (done - self.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "--- sync report: {} ({}, {elapsed:.2}s) ---",
            self.mode, self.state
        );
        let _ = writeln!(
            out,
            "records: {} (attempted {}, succeeded {}, skipped {}, not started {})",
            self.total_records, self.attempted, self.succeeded, self.skipped, self.not_started
        );
        let _ = writeln!(
            out,
            "resolution: {} newly resolved, {} unresolved",
            self.newly_resolved, self.unresolved
        );
        let _ = writeln!(
            out,
            "details: {} ok / {} failed",
            self.details.succeeded, self.details.failed
        );
        let _ = writeln!(
            out,
            "images: {} ok / {} failed",
            self.images.succeeded, self.images.failed
        );
        if self.images_trimmed > 0 {
            let _ = writeln!(out, "image lists trimmed: {}", self.images_trimmed);
        }
        if self.panicked > 0 {
            let _ = writeln!(out, "panicked tasks: {}", self.panicked);
        }
        let _ = writeln!(
            out,
            "directory calls: resolve {}, details {}, photos {}",
            self.cost.resolve_calls, self.cost.details_calls, self.cost.photo_calls
        );
        let _ = writeln!(out, "estimated cost: ${:.3}", self.cost.estimated_cost_usd);
        match (self.dry_run, self.dataset_checksum) {
            (true, _) => {
                let _ = writeln!(out, "dry run: outputs not written");
            }
            (false, Some(checksum)) => {
                let _ = writeln!(
                    out,
                    "dataset checksum: {checksum:08x} ({})",
                    if self.dataset_changed { "changed" } else { "unchanged" }
                );
            }
            (false, None) => {}
        }
        if self.interrupted {
            let _ = writeln!(out, "run interrupted before all records started");
        }
        if !self.issues.is_empty() {
            let _ = writeln!(out, "issues ({}):", self.issues.len());
            for issue in &self.issues {
                let failure = issue.failure.map(|f| format!(" [{f}]")).unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {} {:?}: {}{failure} {}",
                    issue.id,
                    issue.name,
                    issue.issue.label(),
                    issue.message
                );
            }
        }
        out
    }

    /// Prints [`RunReport::render`] to stdout.
    pub fn print_summary(&self) {
        print!("{}", self.render());
    }

    fn tally<T>(
        &mut self,
        record: &BusinessRecord,
        result: &Option<FacetResult<T>>,
        kind: IssueKind,
    ) -> bool {
        let counts = match kind {
            IssueKind::ImagesFailed => &mut self.images,
            _ => &mut self.details,
        };
        match result {
            None => true,
            Some(Ok(_)) => {
                counts.succeeded += 1;
                true
            }
            Some(Err(err)) => {
                counts.failed += 1;
                self.push_service_issue(record, kind, err);
                false
            }
        }
    }

    fn push_service_issue(&mut self, record: &BusinessRecord, kind: IssueKind, err: &ServiceError) {
        warn!(id = %record.id, issue = kind.label(), failure = %err.kind, "record issue");
        self.issues.push(RecordIssue {
            id: record.id.clone(),
            name: record.name.clone(),
            issue: kind,
            failure: Some(err.kind),
            message: err.message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::ResolvedFetch;
    use crate::record::PlaceDetails;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
    }

    #[test]
    fn outcomes_are_tallied_per_facet() {
        let mut report = RunReport::new(SyncMode::DataAndImages, started());
        let ok = BusinessRecord::new("r1", "Green Farm");
        let partial = BusinessRecord::new("r2", "Hill Farm");
        let lost = BusinessRecord::new("r3", "Lost Farm");

        report.record_outcome(
            &ok,
            &FetchOutcome::Resolved(ResolvedFetch {
                external_ref: "p1".into(),
                freshly_resolved: true,
                details: Some(Ok(PlaceDetails::default())),
                images: Some(Ok(vec![])),
            }),
        );
        report.record_outcome(
            &partial,
            &FetchOutcome::Resolved(ResolvedFetch {
                external_ref: "p2".into(),
                freshly_resolved: false,
                details: Some(Ok(PlaceDetails::default())),
                images: Some(Err(ServiceError::new(FailureKind::Timeout, "slow"))),
            }),
        );
        report.record_outcome(
            &lost,
            &FetchOutcome::Unresolved(ServiceError::not_found("ZERO_RESULTS")),
        );
        report.record_skipped();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.newly_resolved, 1);
        assert_eq!(report.details, FacetCounts { succeeded: 2, failed: 0 });
        assert_eq!(report.images, FacetCounts { succeeded: 1, failed: 1 });
        assert_eq!(
            report.issues.iter().map(|i| i.issue).collect::<Vec<_>>(),
            vec![IssueKind::ImagesFailed, IssueKind::Unresolved]
        );
        assert_eq!(
            report.issue_ids(),
            HashSet::from(["r2".to_string(), "r3".to_string()])
        );
    }

    #[test]
    fn report_json_reloads_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = RunReport::new(SyncMode::ImagesOnly, started());
        report.record_panic(&BusinessRecord::new("r9", "Odd Farm"), "boom");
        crate::store::write_json_atomic(&path, &report).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"mode\": \"images-only\""));
        assert!(raw.contains("\"issue\": \"panicked\""));
        let reloaded = RunReport::load(&path).unwrap();
        assert_eq!(reloaded, report);
    }

    #[test]
    fn checksum_drift_is_flagged() {
        let mut report = RunReport::new(SyncMode::DataOnly, started());
        report.record_write(7, Some(7));
        assert!(!report.dataset_changed);
        report.record_write(8, Some(7));
        assert!(report.dataset_changed);
        report.record_write(8, None);
        assert!(report.dataset_changed);
    }

    #[test]
    fn summary_mentions_issues() {
        let mut report = RunReport::new(SyncMode::DataOnly, started());
        report.record_outcome(
            &BusinessRecord::new("r1", "Green Farm"),
            &FetchOutcome::Unresolved(ServiceError::not_found("ZERO_RESULTS")),
        );
        let text = report.render();
        assert!(text.contains("--- sync report: data-only (init"));
        assert!(text.contains("r1 \"Green Farm\": unresolved [not_found] ZERO_RESULTS"));
    }
}
