//! Fingerprint module for modplay
//!
//! Derives the cache key of a conversion request. The key is a SHA-256 digest over
//! a domain-separated preimage, so an upload, a single URL and a URL pair can never
//! produce the same fingerprint.
//!
//! URL normalization trims surrounding whitespace and lowercases the scheme and the
//! host. Everything else, path case included, is hashed exactly as given.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

const UPLOAD_TAG: &[u8] = b"modplay:upload";
const URL_TAG: &[u8] = b"modplay:url";
const DUAL_TAG: &[u8] = b"modplay:dual";
const MEMBER_TAG: &[u8] = b"member:";

/// Where the bytes of a conversion come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Bytes uploaded by the client
    Upload { bytes: Bytes },
    /// One module fetched from a URL
    SingleUrl(String),
    /// Two-file module: song data plus sample data
    DualUrl { mdat: String, smpl: String },
}

/// Immutable description of a requested conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub source: SourceKind,
    /// Archive member to convert instead of the first playable one
    pub member_hint: Option<String>,
}

impl ConversionRequest {
    pub fn upload(bytes: impl Into<Bytes>) -> Self {
        Self {
            source: SourceKind::Upload {
                bytes: bytes.into(),
            },
            member_hint: None,
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            source: SourceKind::SingleUrl(url.into()),
            member_hint: None,
        }
    }

    pub fn dual(mdat: impl Into<String>, smpl: impl Into<String>) -> Self {
        Self {
            source: SourceKind::DualUrl {
                mdat: mdat.into(),
                smpl: smpl.into(),
            },
            member_hint: None,
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member_hint = Some(member.into());
        self
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid fingerprint: {0}")]
pub struct FingerprintParseError(String);

/// Hex-encoded SHA-256 identity of a conversion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of the hex form
    pub const LEN: usize = 64;

    /// Parse a fingerprint from its hex form.
    ///
    /// Only 64 lowercase hex characters are accepted, which keeps fingerprints
    /// safe to use as path and object-key components.
    pub fn parse(s: &str) -> Result<Self, FingerprintParseError> {
        let valid = s.len() == Self::LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(FingerprintParseError(s.chars().take(80).collect()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a source URL before hashing.
///
/// Trims whitespace and lowercases the scheme and host. Userinfo, port, path,
/// query and fragment are left untouched.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();

    let Some(scheme_end) = trimmed.find("://") else {
        return trimmed.to_string();
    };
    let (scheme, rest) = trimmed.split_at(scheme_end);
    let rest = &rest[3..];

    let authority_end = rest
        .find(|c: char| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    let authority = match authority.rfind('@') {
        Some(at) => {
            let (userinfo, host) = authority.split_at(at);
            format!("{}{}", userinfo, host.to_ascii_lowercase())
        }
        None => authority.to_ascii_lowercase(),
    };

    format!("{}://{}{}", scheme.to_ascii_lowercase(), authority, tail)
}

/// Compute the fingerprint of a request
pub fn derive(request: &ConversionRequest) -> Fingerprint {
    let mut hasher = Sha256::new();

    match &request.source {
        SourceKind::Upload { bytes } => {
            hasher.update(UPLOAD_TAG);
            hasher.update([0u8]);
            hasher.update(bytes);
        }
        SourceKind::SingleUrl(url) => {
            hasher.update(URL_TAG);
            hasher.update([0u8]);
            hasher.update(normalize_url(url).as_bytes());
        }
        SourceKind::DualUrl { mdat, smpl } => {
            hasher.update(DUAL_TAG);
            hasher.update([0u8]);
            hasher.update(normalize_url(mdat).as_bytes());
            hasher.update([0u8]);
            hasher.update(normalize_url(smpl).as_bytes());
        }
    }

    if let Some(member) = &request.member_hint {
        hasher.update([0u8]);
        hasher.update(MEMBER_TAG);
        hasher.update(member.as_bytes());
    }

    Fingerprint(hex::encode(hasher.finalize()))
}
