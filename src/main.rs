//! nv_scan command line.
//!
//! Runs scans and the idle watchdog against the simulated rig, and prints the
//! merged station settings.
//!
//! ```bash
//! nv_scan scan --request run.toml --config config/nv_scan.toml --stop-after 40
//! nv_scan watch --duration 30s
//! RUST_LOG=nv_scan=debug nv_scan check-config
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use nv_scan::config::{RunRequest, Settings};
use nv_scan::hardware::mock::MockRig;
use nv_scan::messages::{ScanEvent, TerminalReason};
use nv_scan::scan::ScanSupervisor;
use nv_scan::watchdog::Watchdog;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser, Debug)]
#[command(name = "nv_scan", version, about)]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand, Debug)]
enum Action {
    /// Run a scan on the simulated rig and print its events
    Scan(ScanArgs),
    /// Run the idle watchdog on the simulated rig
    Watch(WatchArgs),
    /// Print the merged settings as TOML
    CheckConfig(ConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Station settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Run request (scan, microwave and acquisition tables)
    #[arg(short, long)]
    request: PathBuf,
    #[command(flatten)]
    settings: ConfigArgs,
    /// Override the request's reference threshold
    #[arg(short, long)]
    threshold: Option<i64>,
    /// Request a stop after this many data points
    #[arg(long)]
    stop_after: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    settings: ConfigArgs,
    /// How long to keep watching, e.g. "30s" or "5m"
    #[arg(short, long, value_parser = humantime::parse_duration)]
    duration: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.action {
        Action::Scan(args) => run_scan(args).await,
        Action::Watch(args) => run_watch(args).await,
        Action::CheckConfig(args) => {
            let settings = Settings::load(args.config.as_deref())?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let settings = Settings::load(args.settings.config.as_deref())?;
    let text = std::fs::read_to_string(&args.request)
        .with_context(|| format!("reading run request {}", args.request.display()))?;
    let mut request = RunRequest::from_toml(&text)?;
    if let Some(threshold) = args.threshold {
        request.acquisition.threshold = threshold;
    }

    let rig = MockRig::builder().build();
    let mut handle = ScanSupervisor::start(request, rig.devices(), settings);
    let mut points = 0;
    while let Some(event) = handle.next_event().await {
        match &event {
            ScanEvent::Data { signal, reference } => {
                points += 1;
                println!("point {points}: signal={signal} reference={reference}");
                if args.stop_after.is_some_and(|limit| points >= limit) {
                    info!(points, "Requesting stop");
                    handle.stop();
                }
            }
            ScanEvent::Tracking { counts } => println!("  tracking: {counts}"),
            ScanEvent::Status(status) => println!("{status}"),
            ScanEvent::Terminal(reason) => println!("finished: {reason:?}"),
        }
    }

    match handle.wait().await {
        TerminalReason::Error(message) => anyhow::bail!("scan failed: {message}"),
        _ => Ok(()),
    }
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    let settings = Settings::load(args.settings.config.as_deref())?;
    let rig = MockRig::builder().build();
    let mut handle = Watchdog::start(rig.devices(), settings);

    let deadline = tokio::time::sleep(args.duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(ScanEvent::Status(status)) => println!("{status}"),
                Some(ScanEvent::Terminal(_)) => {}
                Some(other) => println!("{other:?}"),
                None => break,
            },
            () = &mut deadline => break,
        }
    }

    match handle.shutdown().await {
        TerminalReason::Error(message) => anyhow::bail!("watchdog failed: {message}"),
        reason => {
            println!("finished: {reason:?}");
            Ok(())
        }
    }
}
