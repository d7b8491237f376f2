//! Ingestion driver: pending locations → archive fetch → normalize → reconciling commit →
//! staging purge, fanned out over a bounded worker pool.

pub mod catalog_sync;
pub mod config;
pub mod normalize;
pub mod reconcile;
pub mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use aqarc_core::{CanonicalSensorIndex, Location, LocationId};
use aqarc_storage::{
    ArchiveError, ArchiveFetcher, ArchiveTransport, AwsCliTransport, BackoffPolicy,
    LocalMirrorTransport, StagingArea,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use catalog_sync::{sync_catalog, CatalogSyncSummary};
pub use config::{ConfigError, IngestConfig};
pub use normalize::{normalize, NormalizeError, NormalizedBatch};
pub use reconcile::{commit, CommitOutcome, ConflictReason, ReconcileError, SensorRemap};
pub use store::{IngestStore, LocationState, MemoryStore, PgStore, StoreError};

pub const CRATE_NAME: &str = "aqarc-sync";

/// One single-permit semaphore per location: commits for the same location queue up,
/// different locations never contend.
#[derive(Debug, Default)]
pub struct PartitionLocks {
    locks: Mutex<HashMap<LocationId, Arc<Semaphore>>>,
}

impl PartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, location_id: LocationId) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(location_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .with_context(|| format!("partition lock for location {location_id} closed"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Fetch,
    Normalize,
    Commit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocationOutcome {
    Ingested {
        rows_submitted: usize,
        rows_written: u64,
        attempts: usize,
        remaps: Vec<SensorRemap>,
        dropped_rows: usize,
        partition_files: usize,
    },
    Skipped {
        reason: String,
    },
    Failed {
        stage: Stage,
        error: String,
        /// Staging data left in place for inspection or a later retry.
        retained: Option<PathBuf>,
    },
    Cancelled {
        retained: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    pub location_id: LocationId,
    pub name: String,
    pub outcome: LocationOutcome,
    /// Set when a staging directory should have been purged but could not be.
    pub cleanup_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub transport: String,
    pub catalog_locations: usize,
    pub unknown_coverage: usize,
    pub already_ingested: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rows_written: u64,
    pub locations: Vec<LocationReport>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn retained_paths(&self) -> impl Iterator<Item = (&LocationReport, &Path)> {
        self.locations.iter().filter_map(|report| match &report.outcome {
            LocationOutcome::Failed {
                retained: Some(path),
                ..
            }
            | LocationOutcome::Cancelled {
                retained: Some(path),
            } => Some((report, path.as_path())),
            _ => None,
        })
    }
}

/// Pending work as seen by the store before any location is touched.
#[derive(Debug, Clone, Default)]
pub struct PendingLocations {
    pub pending: Vec<Location>,
    pub catalog_locations: usize,
    pub unknown_coverage: usize,
    pub already_ingested: usize,
}

/// Locations with known coverage and no stored measurements.
pub async fn pending_locations(store: &dyn IngestStore) -> Result<PendingLocations> {
    let states = store
        .location_states()
        .await
        .context("listing stored locations")?;
    let mut result = PendingLocations {
        catalog_locations: states.len(),
        ..PendingLocations::default()
    };
    for LocationState { location, ingested } in states {
        if location.coverage_years().is_none() {
            result.unknown_coverage += 1;
        } else if ingested {
            result.already_ingested += 1;
        } else {
            result.pending.push(location);
        }
    }
    Ok(result)
}

/// Archive transport selected by configuration: a local mirror when one is set, the AWS CLI
/// otherwise.
pub fn transport_from_config(config: &IngestConfig) -> Arc<dyn ArchiveTransport> {
    match &config.archive_mirror {
        Some(root) => Arc::new(LocalMirrorTransport::new(root.clone())),
        None => Arc::new(AwsCliTransport::new(
            config.aws_bin.clone(),
            config.archive_bucket.clone(),
        )),
    }
}

pub struct IngestPipeline {
    store: Arc<dyn IngestStore>,
    transport: Arc<dyn ArchiveTransport>,
    fetcher: ArchiveFetcher,
    staging: StagingArea,
    locks: PartitionLocks,
    concurrency: usize,
    max_attempts: usize,
    reports_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        config: &IngestConfig,
        store: Arc<dyn IngestStore>,
        transport: Arc<dyn ArchiveTransport>,
    ) -> Self {
        Self {
            store,
            fetcher: ArchiveFetcher::new(transport.clone(), BackoffPolicy::default()),
            transport,
            staging: StagingArea::new(config.staging_dir.clone()),
            locks: PartitionLocks::new(),
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_reconcile_attempts,
            reports_dir: Some(config.reports_dir.clone()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.fetcher = self.fetcher.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_fetch_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.fetcher = ArchiveFetcher::new(self.transport.clone(), backoff)
            .with_cancellation(self.cancel.clone());
        self
    }

    /// Skip writing `ingest_summary.json`/`run_brief.md`.
    pub fn without_reports(mut self) -> Self {
        self.reports_dir = None;
        self
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_run", %run_id);

        let mut summary = async {
            let sensors = self.store.load_sensors().await.context("loading sensors")?;
            let index = CanonicalSensorIndex::build(&sensors);
            let mut pending = pending_locations(self.store.as_ref()).await?;
            info!(
                sensors = sensors.len(),
                parameters = index.len(),
                pending = pending.pending.len(),
                already_ingested = pending.already_ingested,
                unknown_coverage = pending.unknown_coverage,
                transport = self.fetcher.transport_name(),
                "starting ingest"
            );

            let work = std::mem::take(&mut pending.pending);
            let mut locations: Vec<LocationReport> = stream::iter(work)
                .map(|location| self.ingest_location(location, &index))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            locations.sort_by_key(|r| r.location_id);

            Ok::<_, anyhow::Error>(summarize(
                run_id,
                started_at,
                self.fetcher.transport_name(),
                &pending,
                locations,
            ))
        }
        .instrument(span)
        .await?;

        if let Some(root) = &self.reports_dir {
            let dir = write_reports(root, &summary).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }
        Ok(summary)
    }

    /// Run one location through fetch → normalize → commit → purge. Never returns an error:
    /// failures are captured in the report so other locations carry on.
    pub async fn ingest_location(
        &self,
        location: Location,
        index: &CanonicalSensorIndex,
    ) -> LocationReport {
        let span = info_span!("location", location_id = location.id);
        let (outcome, cleanup_error) = self.process(&location, index).instrument(span).await;
        LocationReport {
            location_id: location.id,
            name: location.name,
            outcome,
            cleanup_error,
        }
    }

    async fn process(
        &self,
        location: &Location,
        index: &CanonicalSensorIndex,
    ) -> (LocationOutcome, Option<String>) {
        if self.cancel.is_cancelled() {
            return (LocationOutcome::Cancelled { retained: None }, None);
        }
        let Some(years) = location.coverage_years() else {
            return (
                LocationOutcome::Skipped {
                    reason: "coverage dates unknown".to_string(),
                },
                None,
            );
        };

        let dir = match self.staging.prepare(location).await {
            Ok(dir) => dir,
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not prepare staging directory");
                return (
                    LocationOutcome::Failed {
                        stage: Stage::Staging,
                        error: format!("{err:#}"),
                        retained: None,
                    },
                    None,
                );
            }
        };

        let fetched = match self.fetcher.fetch(location.id, years, &dir).await {
            Ok(report) => report,
            Err(ArchiveError::Cancelled) => {
                return (LocationOutcome::Cancelled { retained: Some(dir) }, None)
            }
            Err(err) => {
                error!(
                    error = %err,
                    path = %dir.display(),
                    "archive fetch failed; staging retained"
                );
                return (
                    LocationOutcome::Failed {
                        stage: Stage::Fetch,
                        error: err.to_string(),
                        retained: Some(dir),
                    },
                    None,
                );
            }
        };

        let normalized = match normalize(&dir).await {
            Ok(normalized) => normalized,
            Err(NormalizeError::EmptyBatch { .. }) => {
                info!(
                    empty_years = fetched.empty_years.len(),
                    "no archive data for coverage window; skipping"
                );
                let cleanup_error = self.purge(&dir).await;
                return (
                    LocationOutcome::Skipped {
                        reason: "no archive partitions for coverage window".to_string(),
                    },
                    cleanup_error,
                );
            }
            Err(err) => {
                error!(
                    error = %err,
                    path = %dir.display(),
                    "normalization failed; staging retained"
                );
                return (
                    LocationOutcome::Failed {
                        stage: Stage::Normalize,
                        error: err.to_string(),
                        retained: Some(dir),
                    },
                    None,
                );
            }
        };

        let committed = match self.locks.acquire(location.id).await {
            Ok(_permit) => {
                reconcile::commit(
                    self.store.as_ref(),
                    normalized.batch,
                    index,
                    &self.cancel,
                    self.max_attempts,
                )
                .await
            }
            Err(err) => {
                return (
                    LocationOutcome::Failed {
                        stage: Stage::Commit,
                        error: format!("{err:#}"),
                        retained: Some(dir),
                    },
                    None,
                )
            }
        };

        match committed {
            Ok(outcome) => {
                info!(
                    rows_written = outcome.rows_written,
                    attempts = outcome.attempts,
                    remapped_sensors = outcome.remaps.len(),
                    "location ingested"
                );
                let cleanup_error = self.purge(&dir).await;
                (
                    LocationOutcome::Ingested {
                        rows_submitted: outcome.rows_submitted,
                        rows_written: outcome.rows_written,
                        attempts: outcome.attempts,
                        remaps: outcome.remaps,
                        dropped_rows: normalized.dropped_rows,
                        partition_files: fetched.partition_files,
                    },
                    cleanup_error,
                )
            }
            Err(ReconcileError::Cancelled { attempts }) => {
                warn!(attempts, path = %dir.display(), "commit cancelled; staging retained");
                (LocationOutcome::Cancelled { retained: Some(dir) }, None)
            }
            Err(err) => {
                error!(error = %err, path = %dir.display(), "commit failed; staging retained");
                (
                    LocationOutcome::Failed {
                        stage: Stage::Commit,
                        error: err.to_string(),
                        retained: Some(dir),
                    },
                    None,
                )
            }
        }
    }

    async fn purge(&self, dir: &Path) -> Option<String> {
        match self.staging.purge(dir).await {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, path = %dir.display(), "failed to purge staging directory");
                Some(err.to_string())
            }
        }
    }
}

fn summarize(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    transport: &str,
    pending: &PendingLocations,
    locations: Vec<LocationReport>,
) -> RunSummary {
    let mut summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        transport: transport.to_string(),
        catalog_locations: pending.catalog_locations,
        unknown_coverage: pending.unknown_coverage,
        already_ingested: pending.already_ingested,
        ingested: 0,
        skipped: 0,
        failed: 0,
        cancelled: 0,
        rows_written: 0,
        locations: Vec::new(),
        reports_dir: None,
    };
    for report in &locations {
        match &report.outcome {
            LocationOutcome::Ingested { rows_written, .. } => {
                summary.ingested += 1;
                summary.rows_written += rows_written;
            }
            LocationOutcome::Skipped { .. } => summary.skipped += 1,
            LocationOutcome::Failed { .. } => summary.failed += 1,
            LocationOutcome::Cancelled { .. } => summary.cancelled += 1,
        }
    }
    summary.locations = locations;
    info!(
        ingested = summary.ingested,
        skipped = summary.skipped,
        failed = summary.failed,
        cancelled = summary.cancelled,
        rows_written = summary.rows_written,
        "ingest finished"
    );
    summary
}

/// Write `ingest_summary.json` and `run_brief.md` under `{root}/{run_id}/`.
pub async fn write_reports(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("ingest_summary.json"), json)
        .await
        .context("writing ingest_summary.json")?;
    fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;

    Ok(reports_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# AQARC Ingest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Transport: {}", summary.transport),
        format!(
            "- Locations: {} stored, {} already ingested, {} without coverage dates",
            summary.catalog_locations, summary.already_ingested, summary.unknown_coverage
        ),
        format!(
            "- Outcomes: {} ingested, {} skipped, {} failed, {} cancelled",
            summary.ingested, summary.skipped, summary.failed, summary.cancelled
        ),
        format!("- Rows written: {}", summary.rows_written),
        String::new(),
        "## Locations".to_string(),
    ];

    for report in &summary.locations {
        let line = match &report.outcome {
            LocationOutcome::Ingested {
                rows_written,
                attempts,
                remaps,
                ..
            } => format!(
                "- {} {}: {} rows written in {} attempt(s), {} sensor(s) remapped",
                report.location_id,
                report.name,
                rows_written,
                attempts,
                remaps.len()
            ),
            LocationOutcome::Skipped { reason } => {
                format!("- {} {}: skipped ({reason})", report.location_id, report.name)
            }
            LocationOutcome::Failed {
                stage,
                error,
                retained,
            } => format!(
                "- {} {}: FAILED at {:?}: {}{}",
                report.location_id,
                report.name,
                stage,
                error,
                retained
                    .as_ref()
                    .map(|p| format!(" (staging kept at `{}`)", p.display()))
                    .unwrap_or_default()
            ),
            LocationOutcome::Cancelled { retained } => format!(
                "- {} {}: cancelled{}",
                report.location_id,
                report.name,
                retained
                    .as_ref()
                    .map(|p| format!(" (staging kept at `{}`)", p.display()))
                    .unwrap_or_default()
            ),
        };
        lines.push(line);
        if let Some(cleanup) = &report.cleanup_error {
            lines.push(format!("  - staging cleanup failed: {cleanup}"));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}
