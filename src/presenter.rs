/// Console front end: renders the status table and status changes, and turns
/// typed commands into registry calls.
use crate::dialog::{Console, StartRequest};
use crate::process::{StartOutcome, StopOutcome};
use crate::registry::{ProgramStatus, StatusChange, StatusRegistry};
use crate::resolve::PathResolver;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

const HELP: &str = "\
Commands:
  list | status        show every program
  status json          show every program as JSON
  start <program>      start a program (asks for options)
  stop <program>       stop a program and all of its children
  front <program>      bring a program's window to the front
  help                 show this help
  quit                 leave the console
<program> is a number from the list, a label, or the full command.";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    StatusJson,
    Start(String),
    Stop(String),
    Front(String),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match (verb.to_ascii_lowercase().as_str(), rest) {
            ("", _) => Command::Empty,
            ("list" | "ls", _) => Command::List,
            ("status", "") => Command::List,
            ("status", "json") => Command::StatusJson,
            ("start", target) if !target.is_empty() => Command::Start(target.to_string()),
            ("stop", target) if !target.is_empty() => Command::Stop(target.to_string()),
            ("front", target) if !target.is_empty() => Command::Front(target.to_string()),
            ("help" | "?", _) => Command::Help,
            ("quit" | "exit" | "q", _) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub fn render_table(rows: &[ProgramStatus]) -> String {
    let width = rows.iter().map(|r| r.label.len()).max().unwrap_or(0);
    rows.iter()
        .map(|r| {
            let pid = r.pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
            let hosted = if r.hosted && r.pid.is_some() {
                " [terminal]"
            } else {
                ""
            };
            format!(
                "{:>2}. {:<width$}  Status: {}{pid}{hosted}",
                r.index, r.label, r.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_change(change: &StatusChange, label: &str) -> String {
    format!(
        "[{}] {label}: {} -> {}",
        change.at.with_timezone(&chrono::Local).format("%H:%M:%S"),
        change.old,
        change.new
    )
}

/// Drive the console until `quit`, end of input, or `shutdown` resolves.
///
/// Polls the registry every `poll_interval` on this task; commands run to
/// completion before the next poll.
pub async fn run<R, W>(
    registry: &mut StatusRegistry,
    console: &mut Console<R, W>,
    resolver: &PathResolver,
    mut events: UnboundedReceiver<StatusChange>,
    poll_interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    console.say(&render_table(&registry.snapshot())).await?;
    console.say("Type 'help' for commands.").await?;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                registry.tick();
            }
            Some(change) = events.recv() => {
                let label = registry.label(&change.name);
                console.say(&render_change(&change, &label)).await?;
            }
            line = console.next_line() => {
                let Some(line) = line? else {
                    tracing::debug!("console input closed");
                    break;
                };
                if handle(registry, console, resolver, Command::parse(&line)).await? == Flow::Quit {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle<R, W>(
    registry: &mut StatusRegistry,
    console: &mut Console<R, W>,
    resolver: &PathResolver,
    command: Command,
) -> std::io::Result<Flow>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match command {
        Command::Empty => {}
        Command::Quit => return Ok(Flow::Quit),
        Command::Help => console.say(HELP).await?,
        Command::Unknown(line) => {
            console
                .say(&format!("Unknown command: {line} (type 'help')"))
                .await?
        }
        Command::List => console.say(&render_table(&registry.snapshot())).await?,
        Command::StatusJson => match serde_json::to_string_pretty(&registry.snapshot()) {
            Ok(json) => console.say(&json).await?,
            Err(e) => tracing::error!(error = %e, "failed to serialize status"),
        },
        Command::Start(target) => {
            let Some(name) = resolve_target(registry, console, &target).await? else {
                return Ok(Flow::Continue);
            };
            let label = registry.label(&name);
            let request = match console.ask_start_options(&label, resolver).await {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(program = %name, error = %e, "start aborted");
                    console.say(&format!("Error: {e}")).await?;
                    return Ok(Flow::Continue);
                }
            };
            let StartRequest::Options { options, hosted } = request else {
                console.say("Cancelled.").await?;
                return Ok(Flow::Continue);
            };
            match registry.start(&name, &options, hosted) {
                Ok(StartOutcome::Started { pid }) => {
                    console.say(&format!("Started {label} (pid {pid}).")).await?
                }
                Ok(StartOutcome::AlreadyRunning { pid }) => {
                    console
                        .say(&format!("{label} is already running (pid {pid})."))
                        .await?
                }
                Err(e) => {
                    tracing::error!(program = %name, error = %e, "start failed");
                    console.say(&format!("Error starting {label}: {e}")).await?;
                }
            }
        }
        Command::Stop(target) => {
            let Some(name) = resolve_target(registry, console, &target).await? else {
                return Ok(Flow::Continue);
            };
            let label = registry.label(&name);
            match registry.stop(&name).await {
                Ok(StopOutcome::Stopped { forced: 0 }) => {
                    console.say(&format!("Stopped {label}.")).await?
                }
                Ok(StopOutcome::Stopped { forced }) => {
                    console
                        .say(&format!("Stopped {label} ({forced} process(es) force-killed)."))
                        .await?
                }
                Ok(StopOutcome::NotRunning) => {
                    console.say(&format!("{label} is not running.")).await?
                }
                Err(e) => console.say(&format!("Error: {e}")).await?,
            }
        }
        Command::Front(target) => {
            let Some(name) = resolve_target(registry, console, &target).await? else {
                return Ok(Flow::Continue);
            };
            if let Err(e) = registry.bring_to_front(&name) {
                console.say(&format!("Error: {e}")).await?;
            }
        }
    }
    Ok(Flow::Continue)
}

async fn resolve_target<R, W>(
    registry: &StatusRegistry,
    console: &mut Console<R, W>,
    target: &str,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match registry.lookup(target) {
        Some(name) => Ok(Some(name.to_string())),
        None => {
            console.say(&format!("No such program: {target}")).await?;
            Ok(None)
        }
    }
}
