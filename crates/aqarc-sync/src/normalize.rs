//! Staged gzip CSV partitions → one `RecordBatch`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use aqarc_core::{LocationId, MeasurementRecord, RecordBatch, SensorId};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

const PARTITION_SUFFIX: &str = ".csv.gz";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("no measurement rows under {}", .path.display())]
    EmptyBatch { path: PathBuf, files: usize },
    #[error("reading partition {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("partition {} is not valid CSV: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("normalizer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Archive row; extra columns (lat/lon, location name) are ignored.
#[derive(Debug, Deserialize)]
struct ArchiveRow {
    location_id: LocationId,
    sensors_id: SensorId,
    datetime: String,
    value: String,
    parameter: String,
    #[serde(default)]
    units: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub batch: RecordBatch,
    pub files: usize,
    pub dropped_rows: usize,
}

/// Partition files under `dir`, recursively, in sorted path order.
pub fn partition_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(PARTITION_SUFFIX))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Read every partition under `dir` on the blocking pool.
pub async fn normalize(dir: &Path) -> Result<NormalizedBatch, NormalizeError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || normalize_blocking(&dir)).await?
}

pub fn normalize_blocking(dir: &Path) -> Result<NormalizedBatch, NormalizeError> {
    let files = partition_files(dir);
    let mut batch = RecordBatch::default();
    let mut dropped_rows = 0usize;

    for path in &files {
        let (rows, dropped) = read_partition(path)?;
        debug!(path = %path.display(), rows = rows.len(), dropped, "read partition");
        dropped_rows += dropped;
        batch.extend(rows);
    }

    if dropped_rows > 0 {
        warn!(dir = %dir.display(), dropped_rows, "dropped unparseable archive rows");
    }
    if batch.is_empty() {
        return Err(NormalizeError::EmptyBatch {
            path: dir.to_path_buf(),
            files: files.len(),
        });
    }

    Ok(NormalizedBatch {
        batch,
        files: files.len(),
        dropped_rows,
    })
}

fn read_partition(path: &Path) -> Result<(Vec<MeasurementRecord>, usize), NormalizeError> {
    let file = File::open(path).map_err(|source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(GzDecoder::new(BufReader::new(file)));

    let mut rows = Vec::new();
    let mut dropped = 0usize;
    for result in reader.deserialize::<ArchiveRow>() {
        let raw = match result {
            Ok(raw) => raw,
            Err(err) if err.is_io_error() => {
                return Err(NormalizeError::Csv {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
            Err(_) => {
                dropped += 1;
                continue;
            }
        };
        match into_record(raw) {
            Some(record) => rows.push(record),
            None => dropped += 1,
        }
    }
    Ok((rows, dropped))
}

fn into_record(raw: ArchiveRow) -> Option<MeasurementRecord> {
    let timestamp = DateTime::parse_from_rfc3339(raw.datetime.trim())
        .ok()?
        .with_timezone(&Utc);
    let value: f64 = raw.value.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(MeasurementRecord {
        location_id: raw.location_id,
        sensor_id: raw.sensors_id,
        timestamp,
        value,
        parameter: raw.parameter.trim().to_string(),
        units: raw.units.as_deref().unwrap_or_default().trim().to_string(),
    })
}
