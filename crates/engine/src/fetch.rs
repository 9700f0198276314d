//! Source fetching module for modplay
//!
//! Downloads module files named by URL. Every URL, including each redirect hop,
//! must pass `validate_source_url` before any request is made, which keeps the
//! fetcher away from loopback, private and otherwise internal addresses.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Most redirect hops followed for a single download
pub const MAX_REDIRECTS: usize = 10;

/// Longest URL kept in log lines
const LOG_URL_MAX_CHARS: usize = 200;

/// Name used when a URL carries no usable file name
const FALLBACK_NAME: &str = "module";

fn is_forbidden_char(c: char) -> bool {
    c.is_control() || matches!(c, ' ' | '"' | '\'' | '`' | ';' | '|' | '&' | '$' | '<' | '>' | '\\')
}

/// Error type for source downloads
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL (or a redirect target) is not allowed
    #[error("unsafe URL: {0}")]
    Unsafe(String),

    /// Connection or protocol failure
    #[error("request failed: {0}")]
    Request(String),

    /// Server answered with a non-2xx status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Body exceeds the size limit
    #[error("response is {actual} bytes, limit is {limit}")]
    TooLarge { limit: u64, actual: u64 },

    /// Request exceeded the download timeout
    #[error("request timed out")]
    Timeout,
}

/// A downloaded source file
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSource {
    pub bytes: Bytes,
    /// Last path segment of the final URL, display only
    pub name: String,
}

/// Downloads source files by URL
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `url`, failing if the body exceeds `limit` bytes
    async fn fetch(&self, url: &str, limit: u64) -> Result<FetchedSource, FetchError>;
}

/// Reject URLs that could reach internal services or smuggle shell syntax
///
/// # Arguments
/// * `url` - URL as given by the client, surrounding whitespace allowed
///
/// # Returns
/// * `Ok(Url)` - The parsed URL
/// * `Err(FetchError::Unsafe)` - The URL must not be fetched
pub fn validate_source_url(url: &str) -> Result<Url, FetchError> {
    check_url(url, false)
}

fn check_url(url: &str, allow_private: bool) -> Result<Url, FetchError> {
    let url = url.trim();
    if url.chars().any(is_forbidden_char) {
        return Err(FetchError::Unsafe("URL contains forbidden characters".to_string()));
    }

    let parsed = Url::parse(url).map_err(|e| FetchError::Unsafe(format!("invalid URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::Unsafe(format!(
            "scheme {} is not allowed",
            parsed.scheme()
        )));
    }

    let blocked = match parsed.host() {
        None => return Err(FetchError::Unsafe("URL has no host".to_string())),
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
        }
        Some(url::Host::Ipv4(v4)) => is_internal_ip(IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_internal_ip(IpAddr::V6(v6)),
    };

    if blocked && !allow_private {
        return Err(FetchError::Unsafe("internal hosts are not allowed".to_string()));
    }
    Ok(parsed)
}

/// Whether an address is loopback, private, link-local or otherwise not public
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => is_internal_v6(v6),
        },
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8, shared address space 100.64.0.0/10, reserved 240.0.0.0/4
        || a == 0
        || (a == 100 && (b & 0xc0) == 64)
        || a >= 240
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7, link-local fe80::/10, documentation 2001:db8::/32
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// Make a URL safe to put in a log line
///
/// Removes control and shell-meta characters and truncates long URLs.
pub fn sanitize_url_for_log(url: &str) -> String {
    let cleaned: String = url.trim().chars().filter(|c| !is_forbidden_char(*c)).collect();
    if cleaned.chars().count() > LOG_URL_MAX_CHARS {
        let truncated: String = cleaned.chars().take(LOG_URL_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        cleaned
    }
}

/// Display name for a downloaded file: its last path segment
pub fn source_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// HTTP(S) source fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    allow_private: bool,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Self::build(timeout, false)
    }

    fn build(timeout: Duration, allow_private: bool) -> Result<Self, FetchError> {
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error(format!("more than {} redirects", MAX_REDIRECTS))
            } else if let Err(e) = check_url(attempt.url().as_str(), allow_private) {
                attempt.error(e.to_string())
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(policy)
            .user_agent(concat!("modplay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Self {
            client,
            allow_private,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_redirect() {
        FetchError::Unsafe(e.to_string())
    } else {
        FetchError::Request(e.without_url().to_string())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, limit: u64) -> Result<FetchedSource, FetchError> {
        let parsed = check_url(url, self.allow_private)?;
        let log_url = sanitize_url_for_log(url);
        debug!(url = %log_url, "Fetching source");

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(declared) = response.content_length() {
            if declared > limit {
                return Err(FetchError::TooLarge {
                    limit,
                    actual: declared,
                });
            }
        }

        let name = source_name_from_url(response.url());
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            let actual = (body.len() + chunk.len()) as u64;
            if actual > limit {
                return Err(FetchError::TooLarge { limit, actual });
            }
            body.extend_from_slice(&chunk);
        }

        info!(url = %log_url, size_bytes = body.len(), "Fetched source");
        Ok(FetchedSource {
            bytes: body.freeze(),
            name,
        })
    }
}
