//! Conflict-repairing upsert: rewrites archive-time sensor ids to their canonical
//! replacement whenever the store rejects a batch on the sensor foreign key.

use std::collections::HashSet;

use aqarc_core::{CanonicalSensorIndex, IndexError, RecordBatch, SensorId};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{ForeignKeyViolation, IngestStore, StoreError};

pub const DEFAULT_MAX_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRemap {
    pub from: SensorId,
    pub rows_rewritten: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    /// Rows the store actually inserted; rows already present are not counted.
    pub rows_written: u64,
    pub rows_submitted: usize,
    pub attempts: usize,
    pub remaps: Vec<SensorRemap>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConflictReason {
    #[error("sensor {0} was reported again after being remapped")]
    RepeatedSensor(SensorId),
    #[error(
        "canonical replacement for sensor {sensor_id} (parameter `{parameter}`) \
         is the sensor itself"
    )]
    SelfReplacement { sensor_id: SensorId, parameter: String },
    #[error("violation names sensor {0}, which is not in the batch")]
    SensorNotInBatch(SensorId),
    #[error("violation is not on the sensor reference: {0}")]
    NonSensorKey(ForeignKeyViolation),
    #[error("violation detail could not be parsed: {0}")]
    UnparsedDetail(String),
    #[error(transparent)]
    UnknownParameter(IndexError),
    #[error("gave up after {0} attempts")]
    AttemptsExhausted(usize),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unrecoverable conflict after {attempts} attempt(s): {reason}")]
    UnrecoverableConflict { attempts: usize, reason: ConflictReason },
    #[error("commit cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn unrecoverable(attempts: usize, reason: ConflictReason) -> ReconcileError {
    ReconcileError::UnrecoverableConflict { attempts, reason }
}

/// Write `batch` into `store`, repairing sensor foreign-key violations until an attempt
/// goes through. Each attempt is a single atomic store call.
pub async fn commit(
    store: &dyn IngestStore,
    mut batch: RecordBatch,
    index: &CanonicalSensorIndex,
    cancel: &CancellationToken,
    max_attempts: usize,
) -> Result<CommitOutcome, ReconcileError> {
    let max_attempts = max_attempts.max(1);
    let mut reported: HashSet<SensorId> = HashSet::new();
    let mut remaps = Vec::new();

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled {
                attempts: attempt - 1,
            });
        }

        let violation = match store.upsert_measurements(batch.rows()).await {
            Ok(rows_written) => {
                debug!(attempt, rows_written, "batch committed");
                return Ok(CommitOutcome {
                    rows_written,
                    rows_submitted: batch.len(),
                    attempts: attempt,
                    remaps,
                });
            }
            Err(StoreError::ForeignKey(violation)) => violation,
            Err(StoreError::UnparsedForeignKey(detail)) => {
                return Err(unrecoverable(attempt, ConflictReason::UnparsedDetail(detail)))
            }
            Err(other) => return Err(other.into()),
        };

        let Some(sensor_id) = violation.sensor_id() else {
            return Err(unrecoverable(attempt, ConflictReason::NonSensorKey(violation)));
        };
        if !reported.insert(sensor_id) {
            return Err(unrecoverable(attempt, ConflictReason::RepeatedSensor(sensor_id)));
        }
        if !batch.distinct_sensors().contains(&sensor_id) {
            return Err(unrecoverable(attempt, ConflictReason::SensorNotInBatch(sensor_id)));
        }

        let rows_rewritten = batch
            .remap_sensor(sensor_id, |row| {
                let canonical = index
                    .canonical_sensor_for(&row.parameter, &row.units)
                    .map_err(ConflictReason::UnknownParameter)?;
                if canonical == sensor_id {
                    return Err(ConflictReason::SelfReplacement {
                        sensor_id,
                        parameter: row.parameter.clone(),
                    });
                }
                Ok(canonical)
            })
            .map_err(|reason| unrecoverable(attempt, reason))?;
        let duplicates_dropped = batch.dedup_natural_keys();

        warn!(
            attempt,
            sensor_id,
            rows_rewritten,
            duplicates_dropped,
            "sensor missing from catalog; remapped to canonical sensors"
        );
        remaps.push(SensorRemap {
            from: sensor_id,
            rows_rewritten,
            duplicates_dropped,
        });
    }

    Err(unrecoverable(
        max_attempts,
        ConflictReason::AttemptsExhausted(max_attempts),
    ))
}
