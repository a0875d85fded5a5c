//! Run state machine: validate, load, fan records out to a bounded worker
//! pool, merge, and write.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::client::{PlacesApi, RateLimitedClient};
use crate::controls::{ModePlan, SyncControls, SyncMode};
use crate::error::{RunFailure, SyncError};
use crate::fetcher::{Facet, FetchOutcome, RecordFetcher};
use crate::merge::merge;
use crate::record::BusinessRecord;
use crate::report::RunReport;
use crate::store;

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Validating mode and controls.
    Init,
    /// Reading the dataset.
    Loading,
    /// Fetching and merging records.
    Processing,
    /// Persisting outputs.
    Writing,
    /// Finished; the report is final.
    Done,
    /// Aborted by a fatal condition.
    Failed,
}

impl RunState {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Loading => "loading",
            RunState::Processing => "processing",
            RunState::Writing => "writing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum RecordStatus {
    Skipped,
    NotStarted,
    Processed(FetchOutcome),
    Panicked(String),
}

struct RecordResult {
    record: BusinessRecord,
    status: RecordStatus,
}

/// Drives one run over a dataset with a shared rate-limited client.
pub struct SyncPipeline {
    controls: SyncControls,
    fetcher: RecordFetcher,
    stop: Arc<AtomicBool>,
    run_at: Option<DateTime<Utc>>,
}

impl SyncPipeline {
    /// Builds a pipeline whose client paces and retries per `controls`.
    pub fn new(controls: SyncControls, api: Arc<dyn PlacesApi>) -> Self {
        let client = RateLimitedClient::new(api, controls.qps(), controls.retry());
        Self::with_client(controls, Arc::new(client))
    }

    /// Builds a pipeline around an existing client.
    pub fn with_client(controls: SyncControls, client: Arc<RateLimitedClient>) -> Self {
        let fetcher = RecordFetcher::new(client, controls.max_images())
            .with_force_resolve(controls.force_resolve());
        Self {
            controls,
            fetcher,
            stop: Arc::new(AtomicBool::new(false)),
            run_at: None,
        }
    }

    /// Shares an externally owned stop flag (e.g. set from a signal handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Pins the timestamp stamped onto merged facets.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Flag that, once set, stops new records from starting.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Controls this pipeline was built with.
    pub fn controls(&self) -> &SyncControls {
        &self.controls
    }

    /// Executes `Init -> Loading -> Processing -> Writing -> Done`.
    ///
    /// Record-level failures land in the report. Fatal conditions return a
    /// [`RunFailure`] naming the state they surfaced in; prior outputs are
    /// left untouched in that case.
    pub async fn run(&self) -> Result<RunReport, RunFailure> {
        let run_at = self.run_at.unwrap_or_else(Utc::now);
        let mode = self.controls.mode();
        let mut report = RunReport::new(mode, run_at);
        report.dry_run = self.controls.dry_run();

        enter(RunState::Init, mode);
        self.controls.validate().map_err(|e| fail(RunState::Init, e))?;
        let plan = mode.plan();
        let retry_ids = match self.controls.retry_from() {
            Some(path) => {
                let ids = RunReport::load(path)
                    .map_err(|e| fail(RunState::Init, e))?
                    .issue_ids();
                info!(path = %path.display(), records = ids.len(), "retrying issues from previous report");
                Some(ids)
            }
            None => None,
        };

        enter(RunState::Loading, mode);
        let dataset = store::load_dataset(
            self.controls.dataset_path(),
            self.controls.import_path(),
            plan.requires_baseline,
        )
        .map_err(|e| fail(RunState::Loading, e))?;
        report.total_records = dataset.records.len();

        enter(RunState::Processing, mode);
        let selection = self.select(&dataset.records, retry_ids.as_ref());
        let results = self.process(dataset.records, selection, plan, run_at).await;
        let mut records = Vec::with_capacity(results.len());
        for result in results {
            match &result.status {
                RecordStatus::Skipped => report.record_skipped(),
                RecordStatus::NotStarted => report.record_not_started(),
                RecordStatus::Processed(outcome) => report.record_outcome(&result.record, outcome),
                RecordStatus::Panicked(message) => {
                    report.record_panic(&result.record, message.as_str())
                }
            }
            records.push(result.record);
        }
        report.cost = self.fetcher.client().cost();
        if plan.facets.contains(Facet::Images) {
            let max_images = self.controls.max_images();
            for record in &mut records {
                if record.clamp_images(max_images) {
                    debug!(id = %record.id, max_images, "trimmed images to the per-record bound");
                    report.images_trimmed += 1;
                }
            }
        }

        if self.controls.dry_run() {
            info!("dry run; skipping writes");
        } else {
            enter(RunState::Writing, mode);
            let written = store::write_outputs(
                self.controls.dataset_path(),
                self.controls.geo_path(),
                &records,
            )
            .map_err(|e| fail(RunState::Writing, e))?;
            report.record_write(written.checksum, dataset.previous_checksum);
        }

        report.state = RunState::Done;
        report.finished_at = Some(Utc::now());
        enter(RunState::Done, mode);
        if let Some(path) = self.controls.report_path() {
            if let Err(err) = store::write_json_atomic(path, &report) {
                warn!(path = %path.display(), error = %err, "failed to write run report");
            }
        }
        Ok(report)
    }

    /// Marks which records the run should process, in dataset order.
    fn select(&self, records: &[BusinessRecord], retry_ids: Option<&HashSet<String>>) -> Vec<bool> {
        let mode = self.controls.mode();
        let refresh_images = self.controls.refresh_images();
        let max_images = self.controls.max_images();
        let mut budget = self.controls.limit();
        records
            .iter()
            .map(|record| {
                if let Some(ids) = retry_ids {
                    if !ids.contains(&record.id) {
                        return false;
                    }
                }
                if mode == SyncMode::ImagesOnly
                    && !refresh_images
                    && !record.images.is_empty()
                    && record.images_within(max_images)
                {
                    debug!(id = %record.id, "images already present; skipping");
                    return false;
                }
                match budget.as_mut() {
                    Some(0) => false,
                    Some(remaining) => {
                        *remaining -= 1;
                        true
                    }
                    None => true,
                }
            })
            .collect()
    }

    async fn process(
        &self,
        records: Vec<BusinessRecord>,
        selection: Vec<bool>,
        plan: ModePlan,
        run_at: DateTime<Utc>,
    ) -> Vec<RecordResult> {
        let mode = self.controls.mode();
        let tasks = records
            .into_iter()
            .zip(selection)
            .map(|(record, selected)| {
                let fetcher = self.fetcher.clone();
                let stop = Arc::clone(&self.stop);
                async move {
                    if !selected {
                        return RecordResult {
                            record,
                            status: RecordStatus::Skipped,
                        };
                    }
                    if stop.load(Ordering::SeqCst) {
                        return RecordResult {
                            record,
                            status: RecordStatus::NotStarted,
                        };
                    }
                    let snapshot = record.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = fetcher.fetch(&snapshot, plan.facets).await;
                        let merged = merge(&snapshot, &outcome, mode, run_at);
                        (merged, outcome)
                    });
                    match handle.await {
                        Ok((merged, outcome)) => RecordResult {
                            record: merged,
                            status: RecordStatus::Processed(outcome),
                        },
                        Err(err) => RecordResult {
                            record,
                            status: RecordStatus::Panicked(join_failure(err)),
                        },
                    }
                }
            });
        stream::iter(tasks)
            .buffered(self.controls.workers())
            .collect()
            .await
    }
}

fn enter(state: RunState, mode: SyncMode) {
    info!(state = %state, mode = %mode, "sync run state");
}

fn fail(stage: RunState, source: SyncError) -> RunFailure {
    error!(stage = %stage, error = %source, "sync run failed");
    RunFailure { stage, source }
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "record task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "record task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls(mode: SyncMode) -> SyncControls {
        SyncControls::new(mode, "unused.json", "unused.geo.json")
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl PlacesApi for Unreachable {
        async fn resolve_place(
            &self,
            _hint: &crate::record::IdentityHint,
        ) -> Result<String, crate::error::ServiceError> {
            unreachable!("selection tests never call the directory")
        }

        async fn fetch_details(
            &self,
            _external_ref: &str,
        ) -> Result<crate::record::PlaceDetails, crate::error::ServiceError> {
            unreachable!("selection tests never call the directory")
        }

        async fn fetch_photos(
            &self,
            _external_ref: &str,
        ) -> Result<Vec<crate::record::PlacePhoto>, crate::error::ServiceError> {
            unreachable!("selection tests never call the directory")
        }
    }

    fn pipeline(controls: SyncControls) -> SyncPipeline {
        SyncPipeline::new(controls, Arc::new(Unreachable))
    }

    fn records() -> Vec<BusinessRecord> {
        let mut with_images = BusinessRecord::new("r2", "Hill Farm");
        with_images.images = vec!["https://img/1".into()];
        vec![
            BusinessRecord::new("r1", "Green Farm"),
            with_images,
            BusinessRecord::new("r3", "Dale Farm"),
        ]
    }

    #[test]
    fn images_only_skips_records_with_images() {
        let selection = pipeline(controls(SyncMode::ImagesOnly)).select(&records(), None);
        assert_eq!(selection, vec![true, false, true]);

        let refresh = controls(SyncMode::ImagesOnly).with_refresh_images(true);
        assert_eq!(pipeline(refresh).select(&records(), None), vec![true, true, true]);
    }

    #[test]
    fn images_only_reselects_records_over_the_bound() {
        let mut crowded = BusinessRecord::new("r4", "Busy Farm");
        crowded.images = ["a", "b", "a", "c", "d"].map(String::from).to_vec();
        let mut repeated = BusinessRecord::new("r5", "Echo Farm");
        repeated.images = ["a", "a"].map(String::from).to_vec();
        let mut input = records();
        input.push(crowded);
        input.push(repeated);

        let selection = pipeline(controls(SyncMode::ImagesOnly)).select(&input, None);
        assert_eq!(selection, vec![true, false, true, true, true]);
    }

    #[test]
    fn limit_caps_selected_records() {
        let limited = controls(SyncMode::DataOnly).with_limit(Some(2));
        assert_eq!(pipeline(limited).select(&records(), None), vec![true, true, false]);
    }

    #[test]
    fn retry_ids_restrict_selection() {
        let ids = HashSet::from(["r3".to_string()]);
        let selection = pipeline(controls(SyncMode::DataOnly)).select(&records(), Some(&ids));
        assert_eq!(selection, vec![false, false, true]);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "record task panicked");
    }

    #[test]
    fn states_render_lowercase() {
        assert_eq!(RunState::Processing.to_string(), "processing");
        assert_eq!(
            serde_json::to_string(&RunState::Failed).unwrap(),
            "\"failed\""
        );
    }
}
