mod config;
mod dialog;
mod platform;
mod presenter;
mod process;
mod registry;
mod resolve;
mod signals;

use clap::Parser;
use config::{Overrides, SentryConfig};
use dialog::Console;
use process::StopPolicy;
use registry::StatusRegistry;
use resolve::PathResolver;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Start, stop and watch a fixed set of programs from one console: each
/// program is polled for liveness, and stopping one takes down its whole
/// process tree.
#[derive(Parser, Debug)]
#[command(name = "procsentry", version, about)]
pub struct Cli {
    /// Programs to supervise: an executable, a script, `python3 script.py ...`,
    /// or a shell command line (quote it)
    #[arg(value_name = "PROGRAM", required = true)]
    programs: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "procsentry.toml")]
    config: PathBuf,

    /// Status poll interval in milliseconds (overrides config)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// How long to wait after SIGTERM before SIGKILL, in milliseconds (overrides config)
    #[arg(long)]
    grace_period_ms: Option<u64>,

    /// Terminal emulator used for terminal-hosted starts (overrides config)
    #[arg(long)]
    terminal: Option<String>,

    /// Extra logging (status polls, signal delivery)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "procsentry=debug"
    } else {
        "procsentry=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "procsentry failed");
            eprintln!("Error: {e}");
            1
        }
    };
    // A pending stdin read sits on a blocking thread that would otherwise
    // keep the runtime from shutting down.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SentryConfig::load(&cli.config)?;
    config.apply(Overrides {
        poll_interval_ms: cli.poll_interval_ms,
        grace_period_ms: cli.grace_period_ms,
        terminal: cli.terminal,
    });

    let resolver = PathResolver::new(config.resolver.clone())?;
    let platform = platform::detect(config.terminal.clone());
    let stop_policy = StopPolicy {
        grace_period: config.stop.grace_period(),
        poll: config.stop.poll(),
    };

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let platform_name = platform.name().to_string();
    let mut registry =
        StatusRegistry::new(&cli.programs, &resolver, platform, stop_policy, events_tx)?;
    tracing::info!(
        programs = registry.len(),
        platform = %platform_name,
        "procsentry starting"
    );

    let mut console = Console::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    presenter::run(
        &mut registry,
        &mut console,
        &resolver,
        events_rx,
        config.supervisor.poll_interval(),
        signals::shutdown_requested(),
    )
    .await?;

    if config.supervisor.stop_on_exit {
        registry.stop_all().await;
    }
    tracing::info!("procsentry exiting");
    Ok(())
}
