//! CLI entry point for modplay
//!
//! Parses command line arguments, loads configuration and runs the engine as a
//! service, a one-shot conversion or a single cache sweep.

use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::StreamExt;
use modplay::{ClientCapabilities, Config, ConversionRequest, Engine, EngineError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// modplay - Conversion cache for Amiga music modules
#[derive(Parser, Debug)]
#[command(name = "modplay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it is missing
    #[arg(short, long, default_value = "modplay.toml", global = true)]
    config: PathBuf,

    /// Skip startup checks (emulator, flac). For testing only.
    #[arg(long, default_value = "false", global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the janitor and status server until Ctrl-C
    Serve,
    /// Convert one module through the cache
    Convert(ConvertArgs),
    /// Run one cache sweep and print the report
    Sweep,
}

#[derive(ClapArgs, Debug)]
struct ConvertArgs {
    /// Local module or archive to upload
    #[arg(long, conflicts_with_all = ["url", "mdat", "smpl"])]
    file: Option<PathBuf>,

    /// Module or archive URL
    #[arg(long, conflicts_with_all = ["mdat", "smpl"])]
    url: Option<String>,

    /// Song data URL of a two-file module
    #[arg(long, requires = "smpl")]
    mdat: Option<String>,

    /// Sample data URL of a two-file module
    #[arg(long, requires = "mdat")]
    smpl: Option<String>,

    /// Archive member to convert
    #[arg(long)]
    member: Option<String>,

    /// Ask for FLAC instead of WAV
    #[arg(long, default_value = "false")]
    flac: bool,

    /// Where to write the audio
    #[arg(short, long)]
    out: PathBuf,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_engine(config: Config, skip_checks: bool) -> Result<Engine, EngineError> {
    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Engine::new_without_checks(config).await
    } else {
        Engine::new(config).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let config = match Config::load_or_default(Some(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // Sweeps need no external tools
    let skip_checks = args.skip_checks || matches!(args.command, Command::Sweep);
    let engine = match build_engine(config, skip_checks).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to initialize engine");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Serve => serve(engine).await,
        Command::Convert(convert_args) => convert(&engine, convert_args).await,
        Command::Sweep => sweep(&engine).await,
    }
}

async fn serve(engine: Engine) -> ExitCode {
    info!(
        bind = %engine.config.status.bind,
        max_concurrent_conversions = engine.concurrency_plan.max_concurrent_conversions,
        "modplay serving"
    );
    let janitor = engine.spawn_janitor();
    let server = engine.start_status_server();
    let updater = engine.start_metrics_updater();

    let result = tokio::signal::ctrl_c().await;
    janitor.abort();
    server.abort();
    updater.abort();

    match result {
        Ok(()) => {
            info!("Shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            ExitCode::FAILURE
        }
    }
}

fn build_request(args: &ConvertArgs, upload: Option<Vec<u8>>) -> Option<ConversionRequest> {
    let request = match (upload, &args.url, &args.mdat, &args.smpl) {
        (Some(bytes), _, _, _) => ConversionRequest::upload(bytes),
        (None, Some(url), _, _) => ConversionRequest::url(url.clone()),
        (None, None, Some(mdat), Some(smpl)) => ConversionRequest::dual(mdat.clone(), smpl.clone()),
        _ => return None,
    };
    Some(match &args.member {
        Some(member) => request.with_member(member.clone()),
        None => request,
    })
}

async fn convert(engine: &Engine, args: ConvertArgs) -> ExitCode {
    let upload = match &args.file {
        Some(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read input file");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };
    let Some(request) = build_request(&args, upload) else {
        error!("One of --file, --url or --mdat/--smpl is required");
        return ExitCode::FAILURE;
    };

    let capabilities = ClientCapabilities {
        accepts_flac: args.flac,
    };
    let handle = match engine.convert(request, capabilities).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "{}", e.public_message());
            return ExitCode::FAILURE;
        }
    };

    let written = write_stream(&handle, &args.out).await;
    engine.release(&handle.fingerprint);

    match written {
        Ok(bytes) => {
            info!(
                fingerprint = %handle.fingerprint,
                format = %handle.format,
                player = %handle.player_format,
                bytes,
                out = %args.out.display(),
                "Conversion written"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(out = %args.out.display(), error = %e, "Failed to write output");
            ExitCode::FAILURE
        }
    }
}

async fn write_stream(
    handle: &modplay::AudioHandle,
    out: &Path,
) -> Result<u64, Box<dyn std::error::Error>> {
    let mut stream = handle.stream().await?;
    let mut file = tokio::fs::File::create(out).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn sweep(engine: &Engine) -> ExitCode {
    let report = engine.sweep().await;
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!(error = %e, "Failed to serialize sweep report");
            return ExitCode::FAILURE;
        }
    }
    if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("modplay").chain(args.iter().copied()))
    }

    #[test]
    fn test_convert_url_arguments() {
        let args = parse(&["convert", "--url", "https://example.com/a.mod", "--out", "a.wav"]).unwrap();
        assert_eq!(args.config, PathBuf::from("modplay.toml"));
        let Command::Convert(convert) = args.command else {
            panic!("expected convert");
        };
        let request = build_request(&convert, None).unwrap();
        assert_eq!(request, ConversionRequest::url("https://example.com/a.mod"));
    }

    #[test]
    fn test_dual_requires_both_urls() {
        assert!(parse(&["convert", "--mdat", "https://x/mdat.a", "--out", "a.wav"]).is_err());
        let args = parse(&[
            "convert",
            "--mdat",
            "https://x/mdat.a",
            "--smpl",
            "https://x/smpl.a",
            "--out",
            "a.wav",
        ])
        .unwrap();
        let Command::Convert(convert) = args.command else {
            panic!("expected convert");
        };
        assert_eq!(
            build_request(&convert, None).unwrap(),
            ConversionRequest::dual("https://x/mdat.a", "https://x/smpl.a")
        );
    }

    #[test]
    fn test_sources_conflict() {
        assert!(parse(&[
            "convert",
            "--file",
            "a.lha",
            "--url",
            "https://x/a.mod",
            "--out",
            "a.wav"
        ])
        .is_err());
    }

    #[test]
    fn test_member_and_global_flags() {
        let args = parse(&[
            "--config",
            "/etc/modplay.toml",
            "convert",
            "--file",
            "pack.zip",
            "--member",
            "mod.intro",
            "--flac",
            "--out",
            "intro.flac",
            "--skip-checks",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/modplay.toml"));
        assert!(args.skip_checks);
        let Command::Convert(convert) = args.command else {
            panic!("expected convert");
        };
        assert!(convert.flac);
        let request = build_request(&convert, Some(b"PK".to_vec())).unwrap();
        assert_eq!(request.member_hint.as_deref(), Some("mod.intro"));
    }

    #[test]
    fn test_missing_source() {
        let args = parse(&["convert", "--out", "a.wav"]).unwrap();
        let Command::Convert(convert) = args.command else {
            panic!("expected convert");
        };
        assert!(build_request(&convert, None).is_none());
    }
}
