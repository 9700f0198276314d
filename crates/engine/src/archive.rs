//! Archive resolution module for modplay
//!
//! Detects LHA and ZIP containers by their magic bytes and picks the member to
//! convert: the hinted one if a hint is given, otherwise the first member (in
//! archive-listing order) whose name is on the module allow-list or whose content
//! carries a known module signature. Anything that is not a container is passed
//! through unchanged.

use bytes::Bytes;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Module format names, matched against a member's extension or its prefix
/// (Amiga modules are often named `mod.title` rather than `title.mod`).
const MODULE_NAMES: &[&str] = &[
    "aam", "ahx", "aon", "bp", "bp3", "bd", "bds", "bsi", "bss", "cm", "cust", "digi", "dll",
    "dmu", "dw", "fc", "fred", "gray", "hip", "hip7", "hipc", "hvl", "instr", "jt", "mdat",
    "med", "mmd0", "mmd1", "mmd2", "mmd3", "mmdc", "mod", "okta", "rk", "sc", "sid", "smus",
    "sng", "ss", "ssd", "sun", "tf", "tfmx", "ym",
];

/// Signatures at offset 0
const HEADER_SIGNATURES: &[&[u8]] = &[
    b"THX", b"HVL", b"OKTASONG", b"MMD0", b"MMD1", b"MMD2", b"MMD3", b"TFMX",
];

/// ProTracker-family tags at offset 1080
const PROTRACKER_TAGS: &[&[u8]] = &[b"M.K.", b"M!K!", b"FLT4", b"FLT8", b"4CHN", b"6CHN", b"8CHN"];
const PROTRACKER_TAG_OFFSET: usize = 1080;

/// Error type for archive resolution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArchiveError {
    /// The container could not be read
    #[error("corrupt archive: {0}")]
    Corrupt(String),

    /// No member matched the module allow-list or signatures
    #[error("archive contains no recognized music module")]
    NoModule,

    /// The requested member does not exist
    #[error("archive member not found: {0}")]
    MemberNotFound(String),

    /// A member is larger than the source size limit
    #[error("archive member {name} is {actual} bytes, limit is {limit}")]
    MemberTooLarge { name: String, limit: u64, actual: u64 },
}

/// Container formats recognized by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Lha,
    Zip,
}

/// A file taken out of a container (or the input itself when not a container)
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMember {
    /// Path inside the archive, display only
    pub name: String,
    pub raw_bytes: Bytes,
    pub size_bytes: u64,
}

/// Detect the container format from the leading bytes
pub fn sniff(data: &[u8]) -> Option<ContainerKind> {
    if data.len() >= 7 && (&data[2..5] == b"-lh" || &data[2..5] == b"-lz") && data[6] == b'-' {
        return Some(ContainerKind::Lha);
    }
    if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
        return Some(ContainerKind::Zip);
    }
    None
}

/// Check a member name against the module allow-list
///
/// Matches on the extension (`title.mod`) or on the part before the first dot
/// (`mod.title`), case-insensitively. Directory components are ignored.
pub fn is_module_name(name: &str) -> bool {
    let base = base_name(name).to_ascii_lowercase();
    let prefix = base.split('.').next().unwrap_or("");
    let extension = match base.rfind('.') {
        Some(dot) => &base[dot + 1..],
        None => "",
    };
    MODULE_NAMES.contains(&prefix) || MODULE_NAMES.contains(&extension)
}

/// Check content for a known module signature
pub fn has_module_signature(data: &[u8]) -> bool {
    if HEADER_SIGNATURES.iter().any(|sig| data.starts_with(sig)) {
        return true;
    }
    data.get(PROTRACKER_TAG_OFFSET..PROTRACKER_TAG_OFFSET + 4)
        .map(|tag| PROTRACKER_TAGS.contains(&tag))
        .unwrap_or(false)
}

fn base_name(name: &str) -> &str {
    name.rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
}

/// How a member is chosen
struct Selector<'a> {
    hint: Option<&'a str>,
}

impl Selector<'_> {
    /// Whether the name alone already decides a match
    fn matches_name(&self, name: &str) -> Option<bool> {
        match self.hint {
            Some(hint) => Some(name == hint || base_name(name) == hint),
            None if is_module_name(name) => Some(true),
            None => None,
        }
    }

    fn matches(&self, name: &str, data: &[u8]) -> bool {
        self.matches_name(name)
            .unwrap_or_else(|| has_module_signature(data))
    }

    fn not_found(&self) -> ArchiveError {
        match self.hint {
            Some(hint) => ArchiveError::MemberNotFound(hint.to_string()),
            None => ArchiveError::NoModule,
        }
    }
}

/// Resolve input bytes to the member that should be converted
///
/// # Arguments
/// * `source_name` - Name reported when the input is not a container
/// * `data` - Raw input bytes
/// * `member_hint` - Member to pick instead of the first module
/// * `max_member_bytes` - Size limit for any extracted member
///
/// # Returns
/// * `Ok(ArchiveMember)` - The selected member, or the input itself
/// * `Err(ArchiveError)` - Unreadable container, no module, or hinted member missing
pub fn resolve(
    source_name: &str,
    data: Bytes,
    member_hint: Option<&str>,
    max_member_bytes: u64,
) -> Result<ArchiveMember, ArchiveError> {
    let selector = Selector { hint: member_hint };

    match sniff(&data) {
        Some(ContainerKind::Lha) => resolve_lha(&data, &selector, max_member_bytes),
        Some(ContainerKind::Zip) => resolve_zip(data, &selector, max_member_bytes),
        None => Ok(ArchiveMember {
            name: source_name.to_string(),
            size_bytes: data.len() as u64,
            raw_bytes: data,
        }),
    }
}

fn read_bounded<R: Read>(
    reader: R,
    name: &str,
    limit: u64,
) -> Result<Vec<u8>, ArchiveError> {
    let mut buf = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| ArchiveError::Corrupt(format!("{}: {}", name, e)))?;
    if buf.len() as u64 > limit {
        return Err(ArchiveError::MemberTooLarge {
            name: name.to_string(),
            limit,
            actual: buf.len() as u64,
        });
    }
    Ok(buf)
}

fn resolve_lha(
    data: &[u8],
    selector: &Selector<'_>,
    limit: u64,
) -> Result<ArchiveMember, ArchiveError> {
    let mut lha = delharc::LhaDecodeReader::new(Cursor::new(data))
        .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

    loop {
        let header = lha.header();
        let name = header.parse_pathname().to_string_lossy().replace('\\', "/");
        let declared_size = header.original_size;

        let name_verdict = selector.matches_name(&name);
        if name_verdict != Some(false) && lha.is_decoder_supported() {
            if declared_size > limit {
                return Err(ArchiveError::MemberTooLarge {
                    name,
                    limit,
                    actual: declared_size,
                });
            }
            let content = read_bounded(&mut lha, &name, limit)?;
            lha.crc_check()
                .map_err(|e| ArchiveError::Corrupt(format!("{}: {}", name, e)))?;

            if selector.matches(&name, &content) {
                return Ok(ArchiveMember {
                    name,
                    size_bytes: content.len() as u64,
                    raw_bytes: Bytes::from(content),
                });
            }
        }

        let more = lha
            .next_file()
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        if !more {
            break;
        }
    }

    Err(selector.not_found())
}

fn resolve_zip(
    data: Bytes,
    selector: &Selector<'_>,
    limit: u64,
) -> Result<ArchiveMember, ArchiveError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

    for index in 0..archive.len() {
        let file = archive
            .by_index(index)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        if selector.matches_name(&name) == Some(false) {
            continue;
        }
        if file.size() > limit {
            return Err(ArchiveError::MemberTooLarge {
                name,
                limit,
                actual: file.size(),
            });
        }

        let content = read_bounded(file, &name, limit)?;
        if selector.matches(&name, &content) {
            return Ok(ArchiveMember {
                name,
                size_bytes: content.len() as u64,
                raw_bytes: Bytes::from(content),
            });
        }
    }

    Err(selector.not_found())
}
