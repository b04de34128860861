mod alert;
mod config;
mod detector;
mod probe;

use alert::{AlertHandler, AlertSound, Silent, TerminalBell};
use clap::Parser;
use detector::{MonitorEvent, StallMonitor};
use probe::CommandProbe;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// Watch a file and raise an alert when it stops growing.
#[derive(Parser, Debug)]
#[command(name = "stallwatch", version, about)]
pub struct Cli {
    /// File or directory to watch
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// Seconds between size probes (overrides stallwatch.toml)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Extra logging (every sample and comparison)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "stallwatch=debug"
    } else {
        "stallwatch=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    // Stdin is read on a blocking thread that would otherwise hold the
    // runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.path.exists() {
        return Err(format!("file not found: {}", cli.path.display()).into());
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    let mut cfg = config::load_config(&cwd);
    if let Some(secs) = cli.interval_secs {
        cfg.interval_secs = secs;
    }
    let probe = CommandProbe::new(&cfg.probe)?;

    println!("Monitoring file: {}", cli.path.display());

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let monitor = StallMonitor::spawn(cli.path.clone(), probe, cfg.interval(), events_tx)?;

    let sound: Box<dyn AlertSound> = if cfg.bell {
        Box::new(TerminalBell)
    } else {
        Box::new(Silent)
    };
    let mut alerts = AlertHandler::new(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        sound,
    );

    let shutdown = shutdown_requested();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => event,
        };
        match event {
            Some(MonitorEvent::Sample { size }) => println!("Current size: {size}"),
            Some(MonitorEvent::ProbeFailed { error }) => eprintln!("Size probe failed: {error}"),
            Some(MonitorEvent::Alert(request)) => {
                let ack = tokio::select! {
                    _ = &mut shutdown => break,
                    ack = alerts.ask(&request) => ack?,
                };
                request.respond(ack);
            }
            Some(MonitorEvent::Finished) | None => break,
        }
    }

    // Dropping the receiver also drops any unanswered alert, which the
    // sampler reads as Stop.
    monitor.stop();
    drop(events);
    monitor.join();
    println!("Monitoring stopped.");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_requested() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}
