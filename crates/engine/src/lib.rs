//! modplay
//!
//! Conversion cache and dispatch engine for Amiga music modules: derives a
//! fingerprint per source, converts each module to WAV at most once through an
//! external emulator, keeps the results in a content-addressed cache with a
//! lazily added FLAC encoding, and evicts idle entries on a schedule.

pub mod archive;
pub mod concurrency;
pub mod dispatcher;
pub mod emulator;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod janitor;
pub mod metrics;
pub mod process;
pub mod singleflight;
pub mod startup;
pub mod status_server;
pub mod store;
pub mod transcode;
pub mod workspace;

pub use modplay_config as config;
pub use modplay_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use dispatcher::{Acquired, Dispatcher, DispatcherSettings};
pub use emulator::{Emulator, EmulatorError, Uade};
pub use engine::{AudioHandle, Engine, EngineError};
pub use error::{ConversionError, DownloadSide};
pub use fetch::{FetchError, HttpFetcher, SourceFetcher};
pub use fingerprint::{derive, ConversionRequest, Fingerprint, SourceKind};
pub use janitor::{Janitor, SweepReport};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, CacheCounters, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use singleflight::{JobState, SingleFlight};
pub use startup::{run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError, StatusState};
pub use store::{AudioFormat, CacheEntry, CacheStore, StorageError};
pub use transcode::{negotiate, AudioEncoder, ClientCapabilities, FlacCli, Transcoder};
pub use workspace::{Workspace, Workspaces};
