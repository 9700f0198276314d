//! Engine startup and wiring for modplay
//!
//! Builds the cache store, dispatcher, transcoder and janitor from a `Config`
//! and exposes the request-facing `convert`/`release` pair plus the background
//! tasks.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::emulator::{Emulator, Uade};
use crate::error::ConversionError;
use crate::fetch::{FetchError, HttpFetcher, SourceFetcher};
use crate::fingerprint::{derive, ConversionRequest, Fingerprint};
use crate::janitor::{Janitor, SweepReport};
use crate::metrics::{collect_system_metrics, new_shared_metrics, SharedMetrics};
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{run_status_server, StatusState};
use crate::store::backends::from_config;
use crate::store::{
    now_unix_ms, AudioFormat, ByteStream, CacheEntry, CacheStore, ObjectStore, StorageError,
};
use crate::transcode::{negotiate, AudioEncoder, ClientCapabilities, FlacCli, Transcoder};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval of the metrics updater
const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for engine construction
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Storage backend could not be initialized
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// HTTP client could not be built
    #[error("Fetcher error: {0}")]
    Fetcher(#[from] FetchError),
}

/// Converted audio ready to be streamed to a client
///
/// Holds one reader on the entry; hand the fingerprint back to
/// `Engine::release` once streaming is done.
pub struct AudioHandle {
    pub fingerprint: Fingerprint,
    pub format: AudioFormat,
    pub content_length: u64,
    pub player_format: String,
    pub source_name: String,
    store: Arc<CacheStore>,
}

impl std::fmt::Debug for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandle")
            .field("fingerprint", &self.fingerprint)
            .field("format", &self.format)
            .field("content_length", &self.content_length)
            .field("player_format", &self.player_format)
            .field("source_name", &self.source_name)
            .finish()
    }
}

impl AudioHandle {
    /// MIME type of the served format
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    /// Stream the audio from the cache store
    pub async fn stream(&self) -> Result<ByteStream, ConversionError> {
        Ok(self.store.stream(&self.fingerprint, self.format).await?)
    }

    /// Read the whole audio into memory
    pub async fn read_all(&self) -> Result<Bytes, ConversionError> {
        Ok(self.store.read(&self.fingerprint, self.format).await?)
    }
}

/// The conversion cache and dispatch engine
pub struct Engine {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    store: Arc<CacheStore>,
    dispatcher: Dispatcher,
    transcoder: Option<Transcoder>,
    janitor: Arc<Janitor>,
    emulator: Arc<dyn Emulator>,
}

impl Engine {
    /// Initialize the engine from configuration
    ///
    /// This performs the full startup sequence:
    /// 1. Run startup checks (emulator, encoder, work dir)
    /// 2. Connect the storage backend
    /// 3. Build the engine with the production emulator, fetcher and encoder
    ///
    /// # Arguments
    /// * `config` - Loaded and validated configuration
    ///
    /// # Returns
    /// * `Ok(Engine)` - Engine initialized successfully
    /// * `Err(EngineError)` - Initialization failed
    pub async fn new(config: Config) -> Result<Self, EngineError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config).await
    }

    /// Initialize the engine without running startup checks
    ///
    /// Useful when external tools are not installed, e.g. for cache-only
    /// maintenance such as a janitor sweep.
    pub async fn new_without_checks(config: Config) -> Result<Self, EngineError> {
        let backend = from_config(&config.storage).await?;
        let emulator = Arc::new(Uade::new(
            &config.conversion.emulator_path,
            config.conversion.probe_timeout(),
        ));
        let fetcher = Arc::new(HttpFetcher::new(config.conversion.download_timeout())?);
        let encoder = Arc::new(FlacCli::new(
            &config.transcode.encoder_path,
            config.transcode.timeout(),
        ));
        Ok(Self::with_parts(config, backend, fetcher, emulator, encoder))
    }

    /// Assemble the engine from explicit capabilities
    pub fn with_parts(
        config: Config,
        backend: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn SourceFetcher>,
        emulator: Arc<dyn Emulator>,
        encoder: Arc<dyn AudioEncoder>,
    ) -> Self {
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let store = Arc::new(CacheStore::new(backend));

        let dispatcher = Dispatcher::new(
            store.clone(),
            fetcher,
            emulator.clone(),
            DispatcherSettings {
                conversion_timeout: config.conversion.timeout(),
                max_source_bytes: config.conversion.max_source_bytes,
                work_dir: config.cache.work_dir.clone(),
                max_concurrent_conversions: concurrency_plan.max_concurrent_conversions as usize,
            },
            metrics.clone(),
        );

        let transcoder = config.transcode.enabled.then(|| {
            Transcoder::new(
                store.clone(),
                encoder,
                dispatcher.workspaces().clone(),
                metrics.clone(),
            )
        });

        let janitor = Arc::new(Janitor::new(
            store.clone(),
            config.cache.ttl(),
            dispatcher.workspaces().clone(),
            metrics.clone(),
        ));

        info!(
            storage_backend = store.backend_name(),
            max_concurrent_conversions = concurrency_plan.max_concurrent_conversions,
            transcode = config.transcode.enabled,
            "Engine initialized"
        );

        Self {
            config,
            concurrency_plan,
            metrics,
            store,
            dispatcher,
            transcoder,
            janitor,
            emulator,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Convert a request, or serve it from the cache
    ///
    /// Picks FLAC when the client accepts it and transcoding is enabled,
    /// encoding it on first use. If the encoding fails the WAV is served
    /// instead. Every `Ok` must be paired with one `release`.
    ///
    /// # Arguments
    /// * `request` - Source description
    /// * `capabilities` - What the client can play
    ///
    /// # Returns
    /// * `Ok(AudioHandle)` - Audio ready to stream
    /// * `Err(ConversionError)` - The conversion failed; nothing is held
    pub async fn convert(
        &self,
        request: ConversionRequest,
        capabilities: ClientCapabilities,
    ) -> Result<AudioHandle, ConversionError> {
        let fingerprint = derive(&request);
        let acquired = self.dispatcher.acquire(&fingerprint, &request).await?;
        // Released here if this future is dropped before the handle exists
        let reader = self.store.reader_guard(&fingerprint);

        let wanted = negotiate(capabilities, self.transcoder.is_some());
        let entry = match (&self.transcoder, wanted) {
            (Some(transcoder), format) if format != AudioFormat::Wav => {
                match transcoder.ensure_alternate(&fingerprint).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(
                            fingerprint = %fingerprint,
                            format = %format,
                            error = %e,
                            "Serving primary format after transcode failure"
                        );
                        acquired.entry
                    }
                }
            }
            _ => acquired.entry,
        };

        let handle = self.handle_for(entry, wanted);
        reader.keep();
        Ok(handle)
    }

    fn handle_for(&self, entry: CacheEntry, wanted: AudioFormat) -> AudioHandle {
        let (format, content_length) = match entry.size_of(wanted) {
            Some(size) => (wanted, size),
            None => (entry.primary.format, entry.primary.size_bytes),
        };
        AudioHandle {
            fingerprint: entry.fingerprint,
            format,
            content_length,
            player_format: entry.metadata.player_format,
            source_name: entry.metadata.source_name,
            store: self.store.clone(),
        }
    }

    /// Drop the reader taken by a successful `convert`
    pub fn release(&self, fingerprint: &Fingerprint) {
        self.store.release(fingerprint);
    }

    /// Run one janitor sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.janitor.sweep().await
    }

    /// Start the periodic janitor
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        self.janitor.clone().spawn(self.config.cache.sweep_interval())
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task on the configured bind
    /// address.
    pub fn start_status_server(&self) -> JoinHandle<()> {
        let bind = self.config.status.bind.clone();
        let state = StatusState {
            metrics: self.metrics.clone(),
            store: self.store.clone(),
            emulator: self.emulator.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = run_status_server(&bind, state).await {
                error!(bind = %bind, error = %e, "Status server error");
            }
        })
    }

    /// Refresh the live gauges and system load in the shared metrics
    pub async fn refresh_metrics(&self) {
        refresh_metrics(&self.metrics, &self.dispatcher, &self.store).await;
    }

    /// Start the metrics update task
    ///
    /// Periodically updates gauges and system metrics in the shared state.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let dispatcher = self.dispatcher.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                refresh_metrics(&metrics, &dispatcher, &store).await;
                tokio::time::sleep(METRICS_REFRESH).await;
            }
        })
    }
}

async fn refresh_metrics(metrics: &SharedMetrics, dispatcher: &Dispatcher, store: &CacheStore) {
    let system = collect_system_metrics();
    let (pending_jobs, running_jobs) = dispatcher.job_counts();
    let active_readers = store.active_readers();

    let mut snapshot = metrics.write().await;
    snapshot.system = system;
    snapshot.pending_jobs = pending_jobs;
    snapshot.running_jobs = running_jobs;
    snapshot.active_readers = active_readers;
    snapshot.timestamp_unix_ms = now_unix_ms() as i64;
}
