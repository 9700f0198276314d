//! Cache entry records and object layout.
//!
//! An entry for fingerprint `fp` is stored as:
//!
//! ```text
//! <fp>/audio.wav       primary format
//! <fp>/audio.flac      alternate format, added lazily
//! <fp>/manifest.json   entry record, written last and deleted first
//! ```

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const MANIFEST_NAME: &str = "manifest.json";
pub(crate) const MANIFEST_VERSION: u32 = 1;

/// Audio encodings the cache can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Uncompressed PCM (primary)
    Wav,
    /// Lossless compressed (alternate)
    Flac,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored encoding of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format: AudioFormat,
    pub size_bytes: u64,
}

/// Descriptive data about the converted module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Archive member or download name, display only
    pub source_name: String,
    /// Player reported by the emulator probe
    pub player_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
}

/// Persisted record of a converted module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default = "manifest_version")]
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub primary: FormatInfo,
    #[serde(default)]
    pub alternate: Option<FormatInfo>,
    pub created_at_ms: u64,
    pub last_accessed_at_ms: u64,
    #[serde(default)]
    pub metadata: EntryMetadata,
    /// Active readers in this process; never persisted
    #[serde(skip)]
    pub ref_count: usize,
}

fn manifest_version() -> u32 {
    MANIFEST_VERSION
}

impl CacheEntry {
    pub(crate) fn new(
        fingerprint: Fingerprint,
        primary: FormatInfo,
        metadata: EntryMetadata,
        now_ms: u64,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            fingerprint,
            primary,
            alternate: None,
            created_at_ms: now_ms,
            last_accessed_at_ms: now_ms,
            metadata,
            ref_count: 0,
        }
    }

    /// Stored size of a format, if present
    pub fn size_of(&self, format: AudioFormat) -> Option<u64> {
        if self.primary.format == format {
            return Some(self.primary.size_bytes);
        }
        self.alternate
            .as_ref()
            .filter(|info| info.format == format)
            .map(|info| info.size_bytes)
    }

    pub fn has_format(&self, format: AudioFormat) -> bool {
        self.size_of(format).is_some()
    }

    /// Whether the entry has been idle for longer than `ttl_ms` at `now_ms`
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_accessed_at_ms) > ttl_ms
    }
}

pub(crate) fn audio_key(fingerprint: &Fingerprint, format: AudioFormat) -> String {
    format!("{}/audio.{}", fingerprint, format.extension())
}

pub(crate) fn manifest_key(fingerprint: &Fingerprint) -> String {
    format!("{}/{}", fingerprint, MANIFEST_NAME)
}

pub(crate) fn entry_prefix(fingerprint: &Fingerprint) -> String {
    format!("{}/", fingerprint)
}

/// Milliseconds since the Unix epoch
pub fn now_unix_ms() -> u64 {
    unix_ms(SystemTime::now())
}

pub fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
