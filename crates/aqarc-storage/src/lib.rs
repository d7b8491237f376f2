//! Location staging, archive transfer and catalog HTTP fetch utilities for AQARC.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aqarc_core::{Location, LocationId};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "aqarc-storage";

pub const DEFAULT_ARCHIVE_BUCKET: &str = "openaq-data-archive";
pub const PARTITION_EXTENSION: &str = "gz";

/// Scratch area holding one exclusively-owned directory per in-flight location.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn location_dir(&self, location: &Location) -> PathBuf {
        let name = sanitize_location_name(&location.name);
        let dir_name = if name.is_empty() {
            location.id.to_string()
        } else {
            format!("{}-{}", location.id, name)
        };
        self.root.join(dir_name)
    }

    /// Create a fresh staging directory for `location`, clearing leftovers from an earlier
    /// failed run.
    pub async fn prepare(&self, location: &Location) -> anyhow::Result<PathBuf> {
        let dir = self.location_dir(location);
        if fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking staging directory {}", dir.display()))?
        {
            warn!(
                location_id = location.id,
                path = %dir.display(),
                "clearing stale staging directory"
            );
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("removing stale staging directory {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating staging directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Remove a staging directory tree. A directory that is already gone is not an error.
    pub async fn purge(&self, dir: &Path) -> std::io::Result<()> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Strip characters that are not valid in file names on common platforms.
pub fn sanitize_location_name(name: &str) -> String {
    name.chars()
        .filter(|c| {
            !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .collect::<String>()
        .trim_matches(' ')
        .to_string()
}

/// Write bytes through a temp file in the destination directory, then rename into place.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = dest
        .parent()
        .with_context(|| format!("destination {} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming temp file {} -> {}", temp_path.display(), dest.display())
        });
    }
    Ok(())
}

/// Count compressed partition files below `dir`. A missing directory counts as empty.
/// Walks the tree synchronously; async callers run it on the blocking pool.
pub fn count_partition_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == PARTITION_EXTENSION)
                .unwrap_or(false)
        })
        .count()
}

/// Archive object prefix for one location/year partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePrefix {
    pub location_id: LocationId,
    pub year: i32,
}

impl ArchivePrefix {
    pub fn key(&self) -> String {
        format!(
            "records/csv.gz/locationid={}/year={}/",
            self.location_id, self.year
        )
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer tool exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Copies every object under an archive prefix into a local directory. An empty prefix
/// is a normal outcome and leaves `dest` empty.
#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn copy_prefix(
        &self,
        prefix: &ArchivePrefix,
        dest: &Path,
    ) -> Result<(), TransferError>;
}

/// Unsigned `aws s3 cp --recursive` against the public archive bucket.
#[derive(Debug, Clone)]
pub struct AwsCliTransport {
    program: String,
    bucket: String,
}

impl AwsCliTransport {
    pub fn new(program: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            bucket: bucket.into(),
        }
    }

    pub fn source_uri(&self, prefix: &ArchivePrefix) -> String {
        format!("s3://{}/{}", self.bucket, prefix.key())
    }
}

impl Default for AwsCliTransport {
    fn default() -> Self {
        Self::new("aws", DEFAULT_ARCHIVE_BUCKET)
    }
}

#[async_trait]
impl ArchiveTransport for AwsCliTransport {
    fn name(&self) -> &'static str {
        "aws-cli"
    }

    async fn copy_prefix(&self, prefix: &ArchivePrefix, dest: &Path) -> Result<(), TransferError> {
        let output = Command::new(&self.program)
            .args(["s3", "cp", "--no-sign-request", "--recursive", "--quiet"])
            .arg(self.source_uri(prefix))
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransferError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransferError::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Reads partitions from a local directory laid out like the archive bucket.
#[derive(Debug, Clone)]
pub struct LocalMirrorTransport {
    root: PathBuf,
}

impl LocalMirrorTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveTransport for LocalMirrorTransport {
    fn name(&self) -> &'static str {
        "local-mirror"
    }

    async fn copy_prefix(&self, prefix: &ArchivePrefix, dest: &Path) -> Result<(), TransferError> {
        let source_dir = self.root.join(prefix.key());
        if !source_dir.is_dir() {
            return Ok(());
        }

        let listing_root = source_dir.clone();
        let files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&listing_root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect::<Vec<_>>()
        })
        .await
        .context("listing local mirror")?;

        for file in files {
            let relative = file
                .strip_prefix(&source_dir)
                .with_context(|| format!("resolving mirror path {}", file.display()))?;
            let bytes = fs::read(&file)
                .await
                .with_context(|| format!("reading mirror object {}", file.display()))?;
            write_atomic(&dest.join(relative), &bytes).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(
        "archive transfer failed for location {location_id} year {year} \
         after {attempts} attempts: {source}"
    )]
    FetchFailed {
        location_id: LocationId,
        year: i32,
        attempts: usize,
        #[source]
        source: TransferError,
    },
    #[error("archive fetch cancelled")]
    Cancelled,
    #[error("staging error: {0}")]
    Staging(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub dir: PathBuf,
    pub years_with_data: Vec<i32>,
    pub empty_years: Vec<i32>,
    pub partition_files: usize,
}

/// Pulls location/year partitions into a staging directory, one year at a time.
#[derive(Clone)]
pub struct ArchiveFetcher {
    transport: Arc<dyn ArchiveTransport>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl ArchiveFetcher {
    pub fn new(transport: Arc<dyn ArchiveTransport>, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn fetch(
        &self,
        location_id: LocationId,
        years: RangeInclusive<i32>,
        staging_dir: &Path,
    ) -> Result<FetchReport, ArchiveError> {
        let mut report = FetchReport {
            dir: staging_dir.to_path_buf(),
            years_with_data: Vec::new(),
            empty_years: Vec::new(),
            partition_files: 0,
        };

        for year in years {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let prefix = ArchivePrefix { location_id, year };
            let year_dir = staging_dir.join(year.to_string());
            fs::create_dir_all(&year_dir).await?;

            self.transfer_with_retry(&prefix, &year_dir)
                .instrument(info_span!("archive_transfer", location_id, year))
                .await?;

            let counted = year_dir.clone();
            let files = tokio::task::spawn_blocking(move || count_partition_files(&counted))
                .await
                .map_err(|err| ArchiveError::Staging(std::io::Error::other(err)))?;
            if files == 0 {
                info!(location_id, year, "no archive partitions for year; skipping");
                let _ = fs::remove_dir_all(&year_dir).await;
                report.empty_years.push(year);
            } else {
                debug!(location_id, year, files, "staged archive partitions");
                report.years_with_data.push(year);
                report.partition_files += files;
            }
        }

        Ok(report)
    }

    async fn transfer_with_retry(
        &self,
        prefix: &ArchivePrefix,
        dest: &Path,
    ) -> Result<(), ArchiveError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.transport.copy_prefix(prefix, dest).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt <= self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        attempt,
                        error = %err,
                        ?delay,
                        transport = self.transport.name(),
                        "archive transfer failed; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(ArchiveError::FetchFailed {
                        location_id: prefix.location_id,
                        year: prefix.year,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Per-request retry rules for the catalog API.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts (first try included) when the server answers 5xx.
    pub server_error_attempts: usize,
    pub server_error_delay: Duration,
    pub rate_limit: BackoffPolicy,
    pub transport: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            server_error_attempts: 10,
            server_error_delay: Duration::from_secs(5),
            rate_limit: BackoffPolicy {
                max_retries: 6,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
            transport: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub retry: RetryPolicy,
    pub default_headers: HeaderMap,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            retry: RetryPolicy::default(),
            default_headers: HeaderMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("gave up on {url} after {attempts} attempts (last status {last_status})")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last_status: u16,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(config.default_headers.clone());

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            retry: config.retry,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// GET with the catalog retry rules applied. Non-retryable statuses come back as
    /// `FetchError::HttpStatus` with the response body so callers can decode error payloads.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        self.send_with_retry(url, query)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn send_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut server_errors = 0usize;
        let mut rate_limited = 0usize;
        let mut transport_errors = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::Retryable => {
                            server_errors += 1;
                            if server_errors >= self.retry.server_error_attempts {
                                return Err(FetchError::RetriesExhausted {
                                    url: final_url,
                                    attempts: server_errors + rate_limited,
                                    last_status: status.as_u16(),
                                });
                            }
                            warn!(
                                %status,
                                attempt = server_errors,
                                "server error from catalog; retrying"
                            );
                            self.pause(self.retry.server_error_delay).await?;
                        }
                        RetryDisposition::RateLimited => {
                            if rate_limited >= self.retry.rate_limit.max_retries {
                                return Err(FetchError::RetriesExhausted {
                                    url: final_url,
                                    attempts: server_errors + rate_limited + 1,
                                    last_status: status.as_u16(),
                                });
                            }
                            let backoff = self.retry.rate_limit;
                            let delay = retry_after(resp.headers())
                                .unwrap_or_else(|| backoff.delay_for_attempt(rate_limited))
                                .min(backoff.max_delay);
                            rate_limited += 1;
                            warn!(
                                attempt = rate_limited,
                                ?delay,
                                "rate limited by catalog; backing off"
                            );
                            self.pause(delay).await?;
                        }
                        RetryDisposition::NonRetryable => {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                body,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && transport_errors < self.retry.transport.max_retries
                    {
                        let delay = self.retry.transport.delay_for_attempt(transport_errors);
                        transport_errors += 1;
                        warn!(error = %err, attempt = transport_errors, "request failed; retrying");
                        self.pause(delay).await?;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Integer-seconds `Retry-After`; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
