//! Conversion dispatcher module for modplay
//!
//! Turns a conversion request into a published cache entry. A cache hit returns
//! at once. On a miss, the first caller for a fingerprint runs the job and every
//! concurrent caller waits for that job's outcome:
//!
//! 1. Wait for a conversion slot (the job is `Pending`, then `Running`)
//! 2. Fetch the source file(s) into a fresh job workspace
//! 3. Resolve archives to a single module
//! 4. Probe the player format and render with the emulator, under a timeout
//! 5. Validate the WAV output and publish it to the cache store
//!
//! The workspace is removed on every exit path. A failed job publishes nothing
//! and is not remembered; the next request starts over.

use crate::archive;
use crate::emulator::{Emulator, EmulatorError, DEFAULT_PLAYER_FORMAT};
use crate::error::{ConversionError, DownloadSide};
use crate::fetch::{sanitize_url_for_log, FetchError, FetchedSource, SourceFetcher};
use crate::fingerprint::{ConversionRequest, Fingerprint, SourceKind};
use crate::metrics::{record, SharedMetrics};
use crate::singleflight::{FlightTicket, SingleFlight};
use crate::store::{AudioFormat, CacheEntry, CacheStore, EntryMetadata};
use crate::workspace::Workspaces;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// File names the emulator pairs for two-file modules
const DUAL_MODULE_FILE: &str = "mdat.module";
const DUAL_SAMPLE_FILE: &str = "smpl.module";

const OUTPUT_FILE: &str = "output.wav";
const UPLOAD_NAME: &str = "upload";
const MAX_FILE_NAME_CHARS: usize = 100;

type Flights = SingleFlight<Fingerprint, CacheEntry, ConversionError>;

/// Limits and locations for conversion jobs
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Wall-clock bound for one emulator run
    pub conversion_timeout: Duration,
    /// Limit for uploads, each download and each archive member
    pub max_source_bytes: u64,
    /// Parent directory of job workspaces
    pub work_dir: PathBuf,
    /// Emulator processes allowed to run at once
    pub max_concurrent_conversions: usize,
}

/// Outcome of a successful `acquire`
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub entry: CacheEntry,
    /// Served from the cache without running a job
    pub hit: bool,
}

/// A module staged in the job workspace
struct StagedInput {
    module_path: PathBuf,
    source_name: String,
}

/// Single-flight conversion dispatcher
///
/// Cheap to clone; clones share the job table, the slot semaphore and the store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<CacheStore>,
    fetcher: Arc<dyn SourceFetcher>,
    emulator: Arc<dyn Emulator>,
    flights: Arc<Flights>,
    permits: Arc<Semaphore>,
    settings: Arc<DispatcherSettings>,
    workspaces: Workspaces,
    metrics: SharedMetrics,
}

impl Dispatcher {
    /// Create a new Dispatcher
    ///
    /// # Arguments
    /// * `store` - Cache store results are published to
    /// * `fetcher` - Downloads URL sources
    /// * `emulator` - Renders modules to WAV
    /// * `settings` - Timeouts, size limit, workspace location and slot count
    /// * `metrics` - Shared metrics state for counters
    pub fn new(
        store: Arc<CacheStore>,
        fetcher: Arc<dyn SourceFetcher>,
        emulator: Arc<dyn Emulator>,
        settings: DispatcherSettings,
        metrics: SharedMetrics,
    ) -> Self {
        let permits = settings.max_concurrent_conversions.max(1);
        Self {
            store,
            fetcher,
            emulator,
            flights: SingleFlight::new(),
            permits: Arc::new(Semaphore::new(permits)),
            workspaces: Workspaces::new(settings.work_dir.clone()),
            settings: Arc::new(settings),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Workspace registry shared with the transcoder and janitor
    pub fn workspaces(&self) -> &Workspaces {
        &self.workspaces
    }

    /// Get the number of free conversion slots
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Jobs in flight, as `(pending, running)`
    pub fn job_counts(&self) -> (usize, usize) {
        self.flights.counts()
    }

    /// Acquire the converted audio for a request
    ///
    /// On success the entry has one more registered reader; the caller must pair
    /// this with `CacheStore::release`. All callers that arrive while a job for
    /// the fingerprint is in flight receive that job's outcome.
    ///
    /// # Arguments
    /// * `fingerprint` - Identity derived from `request`
    /// * `request` - Source description
    ///
    /// # Returns
    /// * `Ok(Acquired)` - The ready entry and whether it was a cache hit
    /// * `Err(ConversionError)` - Terminal failure of this request's job
    pub async fn acquire(
        &self,
        fingerprint: &Fingerprint,
        request: &ConversionRequest,
    ) -> Result<Acquired, ConversionError> {
        if let SourceKind::Upload { bytes } = &request.source {
            self.check_size(bytes.len() as u64)?;
        }

        if let Some(entry) = self.store.open(fingerprint).await? {
            let reader = self.store.reader_guard(fingerprint);
            record(&self.metrics, |c| c.hits += 1).await;
            info!(fingerprint = %fingerprint, "Cache hit");
            reader.keep();
            return Ok(Acquired { entry, hit: true });
        }
        record(&self.metrics, |c| c.misses += 1).await;

        let dispatcher = self.clone();
        let job_request = request.clone();
        let mut entry = self
            .flights
            .run(fingerprint.clone(), move |ticket| async move {
                dispatcher.convert(ticket, job_request).await
            })
            .await?;

        entry.ref_count = self.store.retain(fingerprint).await;
        Ok(Acquired { entry, hit: false })
    }

    fn check_size(&self, actual: u64) -> Result<(), ConversionError> {
        let limit = self.settings.max_source_bytes;
        if actual > limit {
            return Err(ConversionError::SourceTooLarge { limit, actual });
        }
        Ok(())
    }

    /// Body of a conversion job; runs once per flight
    async fn convert(
        self,
        ticket: FlightTicket<Fingerprint, CacheEntry, ConversionError>,
        request: ConversionRequest,
    ) -> Result<CacheEntry, ConversionError> {
        let fingerprint = ticket.key().clone();

        // Another flight may have published between our miss and this job
        if self.store.exists(&fingerprint).await? {
            return Ok(self.store.get(&fingerprint).await?);
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConversionError::Aborted)?;
        ticket.mark_running();
        record(&self.metrics, |c| c.conversions_started += 1).await;

        let started = Instant::now();
        let result = self.run_job(&fingerprint, &request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(entry) => {
                let size = entry.primary.size_bytes;
                record(&self.metrics, |c| {
                    c.conversions_succeeded += 1;
                    c.bytes_converted += size;
                })
                .await;
                info!(
                    fingerprint = %fingerprint,
                    player = %entry.metadata.player_format,
                    size_bytes = size,
                    elapsed_ms,
                    "Conversion complete"
                );
            }
            Err(e) => {
                let timed_out = matches!(e, ConversionError::Timeout { .. });
                record(&self.metrics, |c| {
                    c.conversions_failed += 1;
                    if timed_out {
                        c.conversions_timed_out += 1;
                    }
                })
                .await;
                warn!(
                    fingerprint = %fingerprint,
                    kind = e.kind(),
                    error = %e,
                    elapsed_ms,
                    "Conversion failed"
                );
            }
        }
        result
    }

    async fn run_job(
        &self,
        fingerprint: &Fingerprint,
        request: &ConversionRequest,
    ) -> Result<CacheEntry, ConversionError> {
        let workspace = self
            .workspaces
            .create()
            .await
            .map_err(workspace_error)?;

        let staged = self.stage_sources(request, workspace.path()).await?;

        let player_format = self
            .emulator
            .probe(&staged.module_path)
            .await
            .unwrap_or_else(|| DEFAULT_PLAYER_FORMAT.to_string());

        let output = workspace.path().join(OUTPUT_FILE);
        let timeout = self.settings.conversion_timeout;
        match tokio::time::timeout(timeout, self.emulator.render(&staged.module_path, &output))
            .await
        {
            Err(_) => return Err(ConversionError::Timeout { after: timeout }),
            Ok(Err(EmulatorError::Exited { code })) => {
                return Err(ConversionError::Failed { exit_code: code })
            }
            Ok(Err(EmulatorError::Spawn(reason))) => {
                error!(fingerprint = %fingerprint, reason = %reason, "Emulator could not be started");
                return Err(ConversionError::Failed { exit_code: None });
            }
            Ok(Err(EmulatorError::MissingOutput)) => {
                return Err(ConversionError::InvalidOutput(
                    "emulator wrote no output".to_string(),
                ))
            }
            Ok(Ok(())) => {}
        }

        let wav = Bytes::from(tokio::fs::read(&output).await.map_err(|e| {
            ConversionError::InvalidOutput(format!("output unreadable: {}", e.kind()))
        })?);
        let probe = wav.clone();
        let info = tokio::task::spawn_blocking(move || inspect_wav(&probe))
            .await
            .map_err(|_| ConversionError::Aborted)??;

        let metadata = EntryMetadata {
            source_name: staged.source_name,
            player_format,
            sample_rate: info.sample_rate,
            channels: info.channels,
            duration_ms: info.duration_ms,
        };
        let entry = self
            .store
            .put(fingerprint, wav, AudioFormat::Wav, metadata)
            .await?;

        if let Err(e) = workspace.close() {
            warn!(fingerprint = %fingerprint, error = %e, "Failed to remove job workspace");
        }
        Ok(entry)
    }

    /// Fetch, resolve and write the request's module file(s) into `dir`
    async fn stage_sources(
        &self,
        request: &ConversionRequest,
        dir: &Path,
    ) -> Result<StagedInput, ConversionError> {
        match &request.source {
            SourceKind::Upload { bytes } => {
                self.stage_module(UPLOAD_NAME, bytes.clone(), request, dir)
                    .await
            }
            SourceKind::SingleUrl(url) => {
                let fetched = self.download(DownloadSide::Module, url).await?;
                self.stage_module(&fetched.name, fetched.bytes, request, dir)
                    .await
            }
            SourceKind::DualUrl { mdat, smpl } => {
                let module = self.download(DownloadSide::Module, mdat).await?;
                let sample = self.download(DownloadSide::Sample, smpl).await?;

                let module_path = dir.join(DUAL_MODULE_FILE);
                write_file(&module_path, &module.bytes).await?;
                write_file(&dir.join(DUAL_SAMPLE_FILE), &sample.bytes).await?;

                Ok(StagedInput {
                    module_path,
                    source_name: module.name,
                })
            }
        }
    }

    async fn stage_module(
        &self,
        name: &str,
        data: Bytes,
        request: &ConversionRequest,
        dir: &Path,
    ) -> Result<StagedInput, ConversionError> {
        let source_name = name.to_string();
        let hint = request.member_hint.clone();
        let limit = self.settings.max_source_bytes;

        let member = tokio::task::spawn_blocking(move || {
            archive::resolve(&source_name, data, hint.as_deref(), limit)
        })
        .await
        .map_err(|_| ConversionError::Aborted)??;

        let module_path = dir.join(workspace_file_name(&member.name));
        write_file(&module_path, &member.raw_bytes).await?;

        Ok(StagedInput {
            module_path,
            source_name: member.name,
        })
    }

    async fn download(&self, side: DownloadSide, url: &str) -> Result<FetchedSource, ConversionError> {
        self.fetcher
            .fetch(url, self.settings.max_source_bytes)
            .await
            .map_err(|e| match e {
                FetchError::TooLarge { limit, actual } => {
                    ConversionError::SourceTooLarge { limit, actual }
                }
                other => ConversionError::Download {
                    side,
                    url: sanitize_url_for_log(url),
                    reason: other.to_string(),
                },
            })
    }
}

fn workspace_error(e: std::io::Error) -> ConversionError {
    ConversionError::Workspace(e.to_string())
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), ConversionError> {
    tokio::fs::write(path, data).await.map_err(workspace_error)
}

/// File name for a module inside a job workspace
///
/// Keeps the last path component of `name` (the emulator recognises formats by
/// prefix or extension) and replaces anything outside `[A-Za-z0-9._-]`.
pub fn workspace_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "module".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Format details of a rendered WAV file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
}

/// Validate emulator output and read its format
pub fn inspect_wav(data: &[u8]) -> Result<WavInfo, ConversionError> {
    let reader = hound::WavReader::new(std::io::Cursor::new(data))
        .map_err(|e| ConversionError::InvalidOutput(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(ConversionError::InvalidOutput(
            "WAV header has no sample rate or channels".to_string(),
        ));
    }
    let frames = u64::from(reader.duration());
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        duration_ms: frames * 1000 / u64::from(spec.sample_rate),
    })
}
