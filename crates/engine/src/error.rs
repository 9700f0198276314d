//! Error taxonomy for modplay conversions
//!
//! Every terminal outcome of a conversion job is one `ConversionError`. The type is
//! `Clone` because a single failure is fanned out to every waiter of the job.

use crate::archive::ArchiveError;
use crate::singleflight::FlightAborted;
use crate::store::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Which source file of a request a download error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadSide {
    /// The module itself (or the `mdat` half of a dual-file request)
    Module,
    /// The `smpl` half of a dual-file request
    Sample,
}

impl DownloadSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadSide::Module => "module",
            DownloadSide::Sample => "sample",
        }
    }
}

impl std::fmt::Display for DownloadSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a conversion request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    /// Network fetch failed, was rejected, or returned a non-2xx status
    #[error("Download of {side} file failed ({url}): {reason}")]
    Download {
        side: DownloadSide,
        /// Sanitized for logging
        url: String,
        reason: String,
    },

    /// Container unreadable or holding no recognized module
    #[error("Archive extraction failed: {0}")]
    ArchiveExtraction(#[from] ArchiveError),

    /// Emulator exceeded its wall-clock bound and was killed
    #[error("Conversion timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    /// Emulator exited unsuccessfully
    #[error("Conversion failed with exit code {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none (signal)".to_string()))]
    Failed { exit_code: Option<i32> },

    /// Storage operation failed
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Upload, download or archive member over the configured size limit
    #[error("Source too large: {actual} bytes exceeds limit of {limit} bytes")]
    SourceTooLarge { limit: u64, actual: u64 },

    /// Emulator exited 0 but its output is not a usable WAV file
    #[error("Emulator produced invalid output: {0}")]
    InvalidOutput(String),

    /// Job workspace could not be prepared or written
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Conversion task was torn down before producing a result
    #[error("Conversion aborted")]
    Aborted,
}

impl ConversionError {
    /// A message safe to show to end users.
    ///
    /// Never contains filesystem paths, storage details or emulator output.
    pub fn public_message(&self) -> String {
        match self {
            ConversionError::Download { side, .. } => {
                format!("Could not download the {} file", side)
            }
            ConversionError::ArchiveExtraction(ArchiveError::NoModule) => {
                "The archive does not contain a supported music module".to_string()
            }
            ConversionError::ArchiveExtraction(ArchiveError::MemberNotFound(name)) => {
                format!("The archive has no member named '{}'", name)
            }
            ConversionError::ArchiveExtraction(_) => {
                "The archive could not be read".to_string()
            }
            ConversionError::Timeout { after } => {
                format!("Conversion took longer than {} seconds", after.as_secs())
            }
            ConversionError::Failed { .. } | ConversionError::InvalidOutput(_) => {
                "The module could not be converted; the format may be unsupported".to_string()
            }
            ConversionError::SourceTooLarge { limit, .. } => {
                format!("File too large (maximum {} bytes)", limit)
            }
            ConversionError::CacheBackend(_)
            | ConversionError::Workspace(_)
            | ConversionError::Aborted => "Internal error during conversion".to_string(),
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::Download { .. } => "download",
            ConversionError::ArchiveExtraction(_) => "archive_extraction",
            ConversionError::Timeout { .. } => "timeout",
            ConversionError::Failed { .. } => "failed",
            ConversionError::CacheBackend(_) => "cache_backend",
            ConversionError::SourceTooLarge { .. } => "source_too_large",
            ConversionError::InvalidOutput(_) => "invalid_output",
            ConversionError::Workspace(_) => "workspace",
            ConversionError::Aborted => "aborted",
        }
    }
}

impl From<StorageError> for ConversionError {
    fn from(e: StorageError) -> Self {
        ConversionError::CacheBackend(e.to_string())
    }
}

impl From<FlightAborted> for ConversionError {
    fn from(_: FlightAborted) -> Self {
        ConversionError::Aborted
    }
}
