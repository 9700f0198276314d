//! Transcoder module for modplay
//!
//! Produces the lossless-compressed alternate encoding of a cached entry on
//! demand. The first request that needs FLAC for an entry encodes it and attaches
//! it to the entry; concurrent requests for the same entry share that one
//! encoding run, and later requests find it already stored.

use crate::fingerprint::Fingerprint;
use crate::metrics::{record, SharedMetrics};
use crate::process::{self, RunError};
use crate::singleflight::{FlightAborted, SingleFlight};
use crate::store::{AudioFormat, CacheEntry, CacheStore, StorageError};
use crate::workspace::Workspaces;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// User agent fragments of browsers that play FLAC natively
const FLAC_BROWSERS: &[&str] = &["chrome", "chromium", "edge", "firefox", "safari"];

/// Error type for producing an alternate encoding
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranscodeError {
    /// The encoder failed
    #[error("encoder failed: {0}")]
    Encode(String),

    /// Reading the primary or storing the alternate failed
    #[error("cache backend error: {0}")]
    CacheBackend(String),

    /// Scratch files could not be written
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Transcoding is switched off
    #[error("transcoding is disabled")]
    Disabled,

    /// The encoding task was torn down
    #[error("transcode aborted")]
    Aborted,
}

impl From<StorageError> for TranscodeError {
    fn from(e: StorageError) -> Self {
        TranscodeError::CacheBackend(e.to_string())
    }
}

impl From<FlightAborted> for TranscodeError {
    fn from(_: FlightAborted) -> Self {
        TranscodeError::Aborted
    }
}

/// Encodes a WAV file into another format
#[async_trait]
pub trait AudioEncoder: Send + Sync {
    /// Format this encoder produces
    fn format(&self) -> AudioFormat;

    async fn encode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}

/// Build the FLAC encode command (`flac --best --silent -f -o <output> <input>`)
pub fn build_flac_command(binary: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = process::group_command(binary);
    cmd.arg("--best").arg("--silent").arg("-f");
    cmd.arg("-o").arg(output);
    cmd.arg(input);
    cmd
}

/// The reference `flac` command-line encoder
#[derive(Debug, Clone)]
pub struct FlacCli {
    binary: PathBuf,
    timeout: Duration,
}

impl FlacCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl AudioEncoder for FlacCli {
    fn format(&self) -> AudioFormat {
        AudioFormat::Flac
    }

    async fn encode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let cmd = build_flac_command(&self.binary, input, output);
        let status = process::run_with_timeout(cmd, self.timeout)
            .await
            .map_err(|e| match e {
                RunError::TimedOut { after, .. } => {
                    TranscodeError::Encode(format!("timed out after {}s", after.as_secs()))
                }
                other => TranscodeError::Encode(other.to_string()),
            })?;

        if !status.success() {
            return Err(TranscodeError::Encode(format!(
                "exit code {:?}",
                status.code()
            )));
        }
        match tokio::fs::try_exists(output).await {
            Ok(true) => Ok(()),
            _ => Err(TranscodeError::Encode("no output file".to_string())),
        }
    }
}

/// What the client can play
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub accepts_flac: bool,
}

impl ClientCapabilities {
    /// Guess capabilities from a `User-Agent` header
    ///
    /// Mainstream desktop and mobile browsers all play FLAC; anything else
    /// gets WAV.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        Self {
            accepts_flac: FLAC_BROWSERS.iter().any(|browser| ua.contains(browser)),
        }
    }
}

/// Pick the format to serve
///
/// FLAC only when the client accepts it and transcoding is enabled; WAV otherwise.
pub fn negotiate(capabilities: ClientCapabilities, transcode_enabled: bool) -> AudioFormat {
    if capabilities.accepts_flac && transcode_enabled {
        AudioFormat::Flac
    } else {
        AudioFormat::Wav
    }
}

/// Single-flight key: one encoding of one entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlternateKey {
    pub fingerprint: Fingerprint,
    pub format: AudioFormat,
}

impl fmt::Display for AlternateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fingerprint, self.format)
    }
}

/// Lazily attaches alternate encodings to cache entries
#[derive(Clone)]
pub struct Transcoder {
    store: Arc<CacheStore>,
    encoder: Arc<dyn AudioEncoder>,
    flights: Arc<SingleFlight<AlternateKey, CacheEntry, TranscodeError>>,
    workspaces: Workspaces,
    metrics: SharedMetrics,
}

impl Transcoder {
    pub fn new(
        store: Arc<CacheStore>,
        encoder: Arc<dyn AudioEncoder>,
        workspaces: Workspaces,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            encoder,
            flights: SingleFlight::new(),
            workspaces,
            metrics,
        }
    }

    /// Format produced by the configured encoder
    pub fn format(&self) -> AudioFormat {
        self.encoder.format()
    }

    /// Make sure the entry holds the encoder's format, encoding it if needed
    ///
    /// The caller must hold a reader on the entry so it cannot be evicted
    /// meanwhile.
    ///
    /// # Returns
    /// * `Ok(CacheEntry)` - The entry, now carrying the alternate format
    /// * `Err(TranscodeError)` - Encoding or storage failed; nothing is cached
    pub async fn ensure_alternate(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<CacheEntry, TranscodeError> {
        let format = self.encoder.format();
        let entry = self.store.get(fingerprint).await?;
        if entry.has_format(format) {
            return Ok(entry);
        }

        let key = AlternateKey {
            fingerprint: fingerprint.clone(),
            format,
        };
        let transcoder = self.clone();
        self.flights
            .run(key, move |ticket| async move {
                ticket.mark_running();
                transcoder.encode_alternate(ticket.key()).await
            })
            .await
    }

    async fn encode_alternate(&self, key: &AlternateKey) -> Result<CacheEntry, TranscodeError> {
        let entry = self.store.get(&key.fingerprint).await?;
        if entry.has_format(key.format) {
            return Ok(entry);
        }

        let result = self.encode_and_store(key).await;
        match &result {
            Ok(updated) => {
                let primary = updated.primary.size_bytes.max(1);
                let alternate = updated.size_of(key.format).unwrap_or(0);
                record(&self.metrics, |c| c.transcodes += 1).await;
                info!(
                    fingerprint = %key.fingerprint,
                    format = %key.format,
                    size_bytes = alternate,
                    ratio_percent = alternate * 100 / primary,
                    "Stored alternate format"
                );
            }
            Err(e) => {
                record(&self.metrics, |c| c.transcode_failures += 1).await;
                warn!(fingerprint = %key.fingerprint, format = %key.format, error = %e, "Transcode failed");
            }
        }
        result
    }

    async fn encode_and_store(&self, key: &AlternateKey) -> Result<CacheEntry, TranscodeError> {
        let workspace_error = |e: std::io::Error| TranscodeError::Workspace(e.to_string());

        let workspace = self
            .workspaces
            .create()
            .await
            .map_err(workspace_error)?;

        let input = workspace.path().join("input.wav");
        let output = workspace
            .path()
            .join(format!("output.{}", key.format.extension()));

        let primary = self.store.read(&key.fingerprint, AudioFormat::Wav).await?;
        tokio::fs::write(&input, &primary)
            .await
            .map_err(workspace_error)?;

        self.encoder.encode(&input, &output).await?;

        let encoded = Bytes::from(tokio::fs::read(&output).await.map_err(workspace_error)?);
        let entry = self
            .store
            .add_alternate_format(&key.fingerprint, encoded, key.format)
            .await?;

        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove transcode workspace");
        }
        Ok(entry)
    }
}
