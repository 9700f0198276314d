//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Cache lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Idle time after which an unread entry may be evicted (default 1 hour)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Period between janitor sweeps (default 1 hour)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Scratch directory for per-job workspaces
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/modplay/work")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            work_dir: default_work_dir(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for cache entries.
        path: PathBuf,
    },
    /// S3-compatible object storage.
    S3 {
        bucket: String,
        /// Optional endpoint URL (MinIO, GCS interoperability, ...).
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
        /// Key prefix inside the bucket.
        #[serde(default)]
        prefix: Option<String>,
        /// Falls back to the AWS default credential chain when unset.
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        /// Path-style addressing, needed by MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("/tmp/modplay/cache"),
        }
    }
}

impl StorageConfig {
    /// Parse a storage URI of the form `s3://bucket/optional/prefix` or a local path.
    ///
    /// Endpoint, region and credentials of an existing S3 configuration are kept
    /// when the URI only changes bucket or prefix.
    pub fn from_uri(uri: &str, current: &StorageConfig) -> Result<Self, ConfigError> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("s3://") {
            let rest = rest.trim_end_matches('/');
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, Some(prefix.to_string())),
                None => (rest, None),
            };
            if bucket.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "storage uri has no bucket: {}",
                    uri
                )));
            }

            let (endpoint, region, access_key_id, secret_access_key, force_path_style) =
                match current {
                    StorageConfig::S3 {
                        endpoint,
                        region,
                        access_key_id,
                        secret_access_key,
                        force_path_style,
                        ..
                    } => (
                        endpoint.clone(),
                        region.clone(),
                        access_key_id.clone(),
                        secret_access_key.clone(),
                        *force_path_style,
                    ),
                    StorageConfig::Filesystem { .. } => (None, None, None, None, false),
                };

            return Ok(StorageConfig::S3 {
                bucket: bucket.to_string(),
                endpoint,
                region,
                prefix,
                access_key_id,
                secret_access_key,
                force_path_style,
            });
        }

        if uri.is_empty() {
            return Err(ConfigError::Invalid("storage uri is empty".to_string()));
        }

        Ok(StorageConfig::Filesystem {
            path: PathBuf::from(uri),
        })
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err(ConfigError::Invalid("s3 bucket is empty".to_string()));
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(ConfigError::Invalid(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    )),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("storage path is empty".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Short name of the selected backend, used in logs and the health report
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::S3 { .. } => "s3",
        }
    }
}

/// Emulator invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionConfig {
    /// Path to the uade123 binary
    #[serde(default = "default_emulator_path")]
    pub emulator_path: PathBuf,
    /// Wall-clock bound for one emulator run (default 5 minutes)
    #[serde(default = "default_conversion_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound for the player-format probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Bound for a single source download
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Largest accepted upload, download or archive member (default 10 MiB)
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    /// Simultaneous emulator processes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_conversions: u32,
}

fn default_emulator_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/uade123")
}

fn default_conversion_timeout_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_max_source_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            emulator_path: default_emulator_path(),
            timeout_secs: default_conversion_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            max_source_bytes: default_max_source_bytes(),
            max_concurrent_conversions: 0,
        }
    }
}

impl ConversionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Lossless alternate-format configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// Offer FLAC to capable clients (default true)
    #[serde(default = "default_transcode_enabled")]
    pub enabled: bool,
    /// Path or name of the flac encoder binary
    #[serde(default = "default_encoder_path")]
    pub encoder_path: PathBuf,
    /// Wall-clock bound for one encode
    #[serde(default = "default_transcode_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_transcode_enabled() -> bool {
    true
}

fn default_encoder_path() -> PathBuf {
    PathBuf::from("flac")
}

fn default_transcode_timeout_secs() -> u64 {
    60
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: default_transcode_enabled(),
            encoder_path: default_encoder_path(),
            timeout_secs: default_transcode_timeout_secs(),
        }
    }
}

impl TranscodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    /// Listen address for /health and /metrics
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CLEANUP_INTERVAL -> cache.ttl_secs and cache.sweep_interval_secs
    /// - CACHE_TTL_SECS -> cache.ttl_secs (applied after CLEANUP_INTERVAL)
    /// - MAX_UPLOAD_SIZE -> conversion.max_source_bytes
    /// - CONVERSION_TIMEOUT_SECS -> conversion.timeout_secs
    /// - MAX_CONCURRENT_CONVERSIONS -> conversion.max_concurrent_conversions
    /// - UADE_PATH -> conversion.emulator_path
    /// - FLAC_PATH -> transcode.encoder_path
    /// - FLAC_ENABLED -> transcode.enabled
    /// - STATUS_BIND -> status.bind
    /// - STORAGE_URI -> storage
    ///
    /// Unparseable values are ignored and the existing setting is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CLEANUP_INTERVAL") {
            if let Ok(secs) = val.trim().parse::<u64>() {
                self.cache.ttl_secs = secs;
                self.cache.sweep_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("CACHE_TTL_SECS") {
            if let Ok(secs) = val.trim().parse::<u64>() {
                self.cache.ttl_secs = secs;
            }
        }

        if let Ok(val) = env::var("MAX_UPLOAD_SIZE") {
            if let Ok(bytes) = val.trim().parse::<u64>() {
                self.conversion.max_source_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("CONVERSION_TIMEOUT_SECS") {
            if let Ok(secs) = val.trim().parse::<u64>() {
                self.conversion.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_CONVERSIONS") {
            if let Ok(jobs) = val.trim().parse::<u32>() {
                self.conversion.max_concurrent_conversions = jobs;
            }
        }

        if let Ok(val) = env::var("UADE_PATH") {
            if !val.trim().is_empty() {
                self.conversion.emulator_path = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("FLAC_PATH") {
            if !val.trim().is_empty() {
                self.transcode.encoder_path = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("FLAC_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.transcode.enabled = true,
                "false" | "0" | "no" => self.transcode.enabled = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("STATUS_BIND") {
            if !val.trim().is_empty() {
                self.status.bind = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("STORAGE_URI") {
            if let Ok(storage) = StorageConfig::from_uri(&val, &self.storage) {
                self.storage = storage;
            }
        }
    }

    /// Check invariants that TOML types alone cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache.ttl_secs must be > 0".to_string()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.conversion.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "conversion.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.conversion.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "conversion.max_source_bytes must be > 0".to_string(),
            ));
        }
        if self.transcode.enabled && self.transcode.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transcode.timeout_secs must be > 0".to_string(),
            ));
        }
        self.storage.validate()
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.as_ref().exists() => Self::load_from_file(path)?,
            _ => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("CLEANUP_INTERVAL");
        env::remove_var("CACHE_TTL_SECS");
        env::remove_var("MAX_UPLOAD_SIZE");
        env::remove_var("CONVERSION_TIMEOUT_SECS");
        env::remove_var("MAX_CONCURRENT_CONVERSIONS");
        env::remove_var("UADE_PATH");
        env::remove_var("FLAC_PATH");
        env::remove_var("FLAC_ENABLED");
        env::remove_var("STATUS_BIND");
        env::remove_var("STORAGE_URI");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            ttl in 1u64..1_000_000,
            interval in 1u64..1_000_000,
            timeout in 1u64..10_000,
            max_bytes in 1u64..u32::MAX as u64,
            max_jobs in 0u32..64,
            flac_enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[cache]
ttl_secs = {}
sweep_interval_secs = {}
work_dir = "/var/tmp/work"

[storage]
backend = "filesystem"
path = "/var/cache/modplay"

[conversion]
timeout_secs = {}
max_source_bytes = {}
max_concurrent_conversions = {}

[transcode]
enabled = {}

[status]
bind = "0.0.0.0:9000"
"#,
                ttl, interval, timeout, max_bytes, max_jobs, flac_enabled
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.cache.ttl_secs, ttl);
            prop_assert_eq!(config.cache.sweep_interval_secs, interval);
            prop_assert_eq!(config.cache.work_dir, PathBuf::from("/var/tmp/work"));
            prop_assert_eq!(
                config.storage,
                StorageConfig::Filesystem { path: PathBuf::from("/var/cache/modplay") }
            );
            prop_assert_eq!(config.conversion.timeout_secs, timeout);
            prop_assert_eq!(config.conversion.max_source_bytes, max_bytes);
            prop_assert_eq!(config.conversion.max_concurrent_conversions, max_jobs);
            prop_assert_eq!(config.transcode.enabled, flac_enabled);
            prop_assert_eq!(config.status.bind, "0.0.0.0:9000");
        }

        #[test]
        fn prop_cleanup_interval_sets_ttl_and_sweep(
            initial in 1u64..100_000,
            override_secs in 1u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[cache]
ttl_secs = {}
sweep_interval_secs = {}
"#,
                initial, initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CLEANUP_INTERVAL", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cache.ttl_secs, override_secs);
            prop_assert_eq!(config.cache.sweep_interval_secs, override_secs);
        }

        #[test]
        fn prop_env_overrides_max_upload_size(
            initial in 1u64..1_000_000,
            override_bytes in 1u64..u32::MAX as u64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[conversion]
max_source_bytes = {}
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MAX_UPLOAD_SIZE", override_bytes.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.conversion.max_source_bytes, override_bytes);
        }

        #[test]
        fn prop_env_overrides_flac_enabled(
            initial in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[transcode]
enabled = {}
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FLAC_ENABLED", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.transcode.enabled, override_enabled);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.cache.sweep_interval_secs, 3600);
        assert_eq!(config.storage, StorageConfig::default());
        assert_eq!(config.conversion.timeout_secs, 300);
        assert_eq!(config.conversion.max_source_bytes, 10 * 1024 * 1024);
        assert_eq!(config.conversion.max_concurrent_conversions, 0);
        assert!(config.transcode.enabled);
        assert_eq!(config.status.bind, "127.0.0.1:7878");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s3_storage_section_parses() {
        let toml_str = r#"
[storage]
backend = "s3"
bucket = "modules"
endpoint = "minio:9000"
prefix = "cache"
force_path_style = true
"#;
        let config = Config::parse_toml(toml_str).expect("S3 TOML should parse");

        assert_eq!(
            config.storage,
            StorageConfig::S3 {
                bucket: "modules".to_string(),
                endpoint: Some("minio:9000".to_string()),
                region: None,
                prefix: Some("cache".to_string()),
                access_key_id: None,
                secret_access_key: None,
                force_path_style: true,
            }
        );
        assert_eq!(config.storage.backend_name(), "s3");
    }

    #[test]
    fn test_storage_uri_s3_keeps_endpoint() {
        let current = StorageConfig::S3 {
            bucket: "old".to_string(),
            endpoint: Some("http://minio:9000".to_string()),
            region: Some("eu-west-1".to_string()),
            prefix: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let parsed = StorageConfig::from_uri("s3://new-bucket/players/cache/", &current).unwrap();
        match parsed {
            StorageConfig::S3 {
                bucket,
                endpoint,
                prefix,
                force_path_style,
                ..
            } => {
                assert_eq!(bucket, "new-bucket");
                assert_eq!(prefix.as_deref(), Some("players/cache"));
                assert_eq!(endpoint.as_deref(), Some("http://minio:9000"));
                assert!(force_path_style);
            }
            other => panic!("expected s3 config, got {:?}", other),
        }
    }

    #[test]
    fn test_storage_uri_local_path() {
        let parsed = StorageConfig::from_uri("/srv/cache", &StorageConfig::default()).unwrap();
        assert_eq!(
            parsed,
            StorageConfig::Filesystem {
                path: PathBuf::from("/srv/cache")
            }
        );
    }

    #[test]
    fn test_storage_uri_rejects_missing_bucket() {
        let result = StorageConfig::from_uri("s3://", &StorageConfig::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_partial_credentials() {
        let mut config = Config::default();
        config.storage = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = Config::parse_toml("[cache]\nttl_secs = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CONVERSION_TIMEOUT_SECS", "soon");
        env::set_var("FLAC_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.conversion.timeout_secs, 300);
        assert!(config.transcode.enabled);
    }

    #[test]
    fn test_load_or_default_tolerates_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default(Some("/nonexistent/modplay.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
