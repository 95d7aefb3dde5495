//! CLI entry point for Clip Relay
//!
//! Parses command line arguments, sets up logging, starts the daemon and
//! stops it on Ctrl+C or SIGTERM.

use clap::Parser;
use clip_relay::{Config, Daemon, StartupChecks};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Clip Relay - trims new recordings, squeezes them under the upload limit and posts them to a webhook
#[derive(Parser, Debug)]
#[command(name = "clip-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the user configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the defaults file consulted for keys the user file leaves out
    #[arg(short, long, default_value = "defaults.toml")]
    defaults: PathBuf,

    /// Skip ffmpeg/ffprobe startup checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

/// `RUST_LOG` picks the filter; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("clip_relay=info,clip_relay_cli=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    info!(
        config = %args.config.display(),
        defaults = %args.defaults.display(),
        "Clip Relay starting"
    );

    let config = match Config::load(&args.config, &args.defaults) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let checks = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        StartupChecks::Skip
    } else {
        StartupChecks::Run
    };

    let daemon = Daemon::new();
    if let Err(e) = daemon.start(config, checks).await {
        error!(error = %e, "failed to start daemon");
        return ExitCode::FAILURE;
    }

    shutdown_signal().await;
    info!("shutdown requested");
    daemon.stop().await;

    ExitCode::SUCCESS
}
