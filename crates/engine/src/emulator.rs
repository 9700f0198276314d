//! Emulator module for modplay
//!
//! Provides the capability that renders a music module to WAV. The production
//! implementation drives the UADE command-line player (`uade123`) headless;
//! tests substitute a fake through the `Emulator` trait.

use crate::process::{self, RunError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Player name reported when detection yields nothing
pub const DEFAULT_PLAYER_FORMAT: &str = "Module";

/// Error type for emulator runs
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// Emulator binary could not be started
    #[error("emulator could not be started: {0}")]
    Spawn(String),

    /// Emulator exited with non-zero status or was killed by a signal
    #[error("emulator exited with code {code:?}")]
    Exited { code: Option<i32> },

    /// Emulator exited successfully without writing its output file
    #[error("emulator produced no output file")]
    MissingOutput,
}

/// Renders music modules to audio
#[async_trait]
pub trait Emulator: Send + Sync {
    /// Render `input` to a WAV file at `output`
    ///
    /// The caller bounds the run with its own timeout; dropping the future must
    /// stop any work in progress.
    async fn render(&self, input: &Path, output: &Path) -> Result<(), EmulatorError>;

    /// Best-effort detection of the replayer that handles `input`
    async fn probe(&self, input: &Path) -> Option<String>;

    /// Whether the emulator can be run at all
    fn is_available(&self) -> bool;
}

/// UADE headless player
#[derive(Debug, Clone)]
pub struct Uade {
    binary: PathBuf,
    probe_timeout: Duration,
}

impl Uade {
    pub fn new(binary: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            probe_timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// Build the render command
///
/// Runs `uade123 -c -f <output> <input>` from the input's directory, so that
/// companion files (TFMX sample data) are found next to the song data.
///
/// # Arguments
/// * `binary` - Path to `uade123`
/// * `input` - Module file to render
/// * `output` - WAV file to write
pub fn build_render_command(binary: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = process::group_command(binary);
    cmd.arg("-c");
    cmd.arg("-f").arg(output);
    cmd.arg(input);
    if let Some(dir) = input.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    cmd
}

/// Build the probe command (`uade123 -g <input>`)
pub fn build_probe_command(binary: &Path, input: &Path) -> Command {
    let mut cmd = process::group_command(binary);
    cmd.arg("-g").arg(input);
    cmd
}

/// Extract the player name from `uade123 -g` output
///
/// Looks for a `playername:` line; an empty or missing value gives `None`.
pub fn parse_player_name(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("playername:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[async_trait]
impl Emulator for Uade {
    async fn render(&self, input: &Path, output: &Path) -> Result<(), EmulatorError> {
        let cmd = build_render_command(&self.binary, input, output);

        let status = process::run(cmd).await.map_err(|e| match e {
            RunError::Spawn { source, .. } => EmulatorError::Spawn(source.to_string()),
            other => EmulatorError::Spawn(other.to_string()),
        })?;

        if !status.success() {
            return Err(EmulatorError::Exited {
                code: status.code(),
            });
        }

        match tokio::fs::try_exists(output).await {
            Ok(true) => Ok(()),
            _ => Err(EmulatorError::MissingOutput),
        }
    }

    async fn probe(&self, input: &Path) -> Option<String> {
        let cmd = build_probe_command(&self.binary, input);
        match process::capture_stdout(cmd, self.probe_timeout).await {
            Ok((_, stdout)) => {
                let name = parse_player_name(&stdout);
                debug!(player = ?name, "Probed player format");
                name
            }
            Err(e) => {
                warn!(error = %e, "Could not detect player format");
                None
            }
        }
    }

    fn is_available(&self) -> bool {
        self.binary.is_file()
    }
}
