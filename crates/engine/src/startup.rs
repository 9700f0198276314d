//! Startup checks module for modplay
//!
//! Provides preflight checks to verify system requirements before serving:
//! - Emulator binary presence
//! - FLAC encoder availability (when transcoding is enabled)
//! - Writable job work directory

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Emulator not available: {0}")]
    EmulatorUnavailable(String),

    #[error("FLAC encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Work directory unusable: {0}")]
    WorkDir(String),
}

/// Check that the emulator binary exists and is a regular file
pub fn check_emulator_available(path: &Path) -> Result<(), StartupError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        StartupError::EmulatorUnavailable(format!(
            "{} not found; is UADE installed? Error: {}",
            path.display(),
            e
        ))
    })?;

    if !metadata.is_file() {
        return Err(StartupError::EmulatorUnavailable(format!(
            "{} is not a file",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(StartupError::EmulatorUnavailable(format!(
                "{} is not executable",
                path.display()
            )));
        }
    }

    Ok(())
}

/// Parse `flac --version` output and extract the version string
///
/// Handles the reference encoder's format: `flac 1.4.3`.
pub fn parse_flac_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.trim_start().to_lowercase().starts_with("flac "))?;

    let version = line.split_whitespace().nth(1)?;
    if version.chars().next()?.is_ascii_digit() {
        Some(version.to_string())
    } else {
        None
    }
}

/// Check that the FLAC encoder runs by invoking `<encoder> --version`
///
/// # Returns
/// * `Ok(String)` - The reported encoder version
/// * `Err(StartupError)` - The encoder is missing or did not answer
pub fn check_encoder_available(encoder: &Path) -> Result<String, StartupError> {
    let output = Command::new(encoder).arg("--version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} --version failed; is flac installed and in PATH? Error: {}",
            encoder.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} --version exited with {}",
            encoder.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_flac_version(&stdout).ok_or_else(|| {
        StartupError::EncoderUnavailable(format!(
            "could not parse version from: {}",
            stdout.trim()
        ))
    })
}

/// Ensure the job work directory exists and accepts new files
pub fn check_work_dir(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| StartupError::WorkDir(format!("{}: {}", dir.display(), e)))?;
    tempfile::Builder::new()
        .prefix(".modplay-probe")
        .tempfile_in(dir)
        .map_err(|e| StartupError::WorkDir(format!("{}: {}", dir.display(), e)))?;
    Ok(())
}

/// Run all startup checks
///
/// Verifies the emulator, the encoder when transcoding is on, and the work
/// directory.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_emulator_available(&cfg.conversion.emulator_path)?;
    if cfg.transcode.enabled {
        check_encoder_available(&cfg.transcode.encoder_path)?;
    }
    check_work_dir(&cfg.cache.work_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    // Any `flac X.Y.Z` banner yields `X.Y.Z`.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_flac_version_parsing(
            major in 1u32..10,
            minor in 0u32..20,
            patch in 0u32..20,
            preamble in prop::collection::vec("[0-9 .:=-]{0,20}", 0..3),
        ) {
            let mut output = preamble.join("\n");
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!("flac {}.{}.{}\n", major, minor, patch));

            prop_assert_eq!(
                parse_flac_version(&output),
                Some(format!("{}.{}.{}", major, minor, patch))
            );
        }
    }

    #[test]
    fn test_parse_flac_version_invalid() {
        assert_eq!(parse_flac_version(""), None);
        assert_eq!(parse_flac_version("flac"), None);
        assert_eq!(parse_flac_version("flac version unknown"), None);
        assert_eq!(parse_flac_version("ffmpeg version 8.0"), None);
    }

    #[test]
    fn test_missing_emulator() {
        let result = check_emulator_available(Path::new("/nonexistent/uade123"));
        assert!(matches!(result, Err(StartupError::EmulatorUnavailable(_))));
    }

    #[test]
    fn test_emulator_directory_rejected() {
        let dir = TempDir::new().unwrap();
        let result = check_emulator_available(dir.path());
        assert!(matches!(result, Err(StartupError::EmulatorUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_emulator_must_be_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uade123");
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(check_emulator_available(&path).is_err());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check_emulator_available(&path).is_ok());
    }

    #[test]
    fn test_missing_encoder() {
        let result = check_encoder_available(Path::new("/nonexistent/flac"));
        assert!(matches!(result, Err(StartupError::EncoderUnavailable(_))));
    }

    #[test]
    fn test_work_dir_created() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("nested").join("work");
        check_work_dir(&work_dir).unwrap();
        assert!(work_dir.is_dir());
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_startup_checks_fail_without_emulator() {
        let mut cfg = Config::default();
        cfg.conversion.emulator_path = "/nonexistent/uade123".into();
        cfg.transcode.enabled = false;
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::EmulatorUnavailable(_))
        ));
    }
}
