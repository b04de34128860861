/// Desktop integration: hosting a command inside a terminal emulator and
/// raising a process's window. One implementation per platform, picked once
/// at startup.
use crate::config::TerminalConfig;
use std::process::{Command, ExitStatus};

/// Errors from the advisory window-activation path.
#[derive(Debug)]
pub enum PlatformError {
    /// No activation mechanism on this platform.
    Unsupported,
    /// The helper tool could not be run.
    Helper {
        tool: &'static str,
        source: std::io::Error,
    },
    /// The helper ran but found nothing to activate.
    NoWindow { pid: u32 },
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformError::Unsupported => {
                write!(f, "window activation is not supported on this platform")
            }
            PlatformError::Helper { tool, source } => write!(f, "failed to run {tool}: {source}"),
            PlatformError::NoWindow { pid } => write!(f, "no window found for pid {pid}"),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Helper { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Platform-specific desktop capabilities.
pub trait Platform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Bring the window owned by `pid` to the front. `hosted` means `pid` is
    /// a terminal emulator wrapping the real program.
    fn activate_window(&self, pid: u32, hosted: bool) -> Result<(), PlatformError>;

    /// Argument vector that runs `argv` inside a terminal emulator, or
    /// `None` when no terminal is available.
    fn wrap_in_terminal(&self, argv: &[String]) -> Option<Vec<String>>;
}

/// Linux/X11 desktop: configurable terminal emulator, `wmctrl` activation.
pub struct LinuxDesktop {
    terminal: TerminalConfig,
}

impl LinuxDesktop {
    pub fn new(terminal: TerminalConfig) -> Self {
        Self { terminal }
    }
}

impl Platform for LinuxDesktop {
    fn name(&self) -> &str {
        "linux"
    }

    fn activate_window(&self, pid: u32, _hosted: bool) -> Result<(), PlatformError> {
        let output = Command::new("wmctrl")
            .arg("-lp")
            .output()
            .map_err(|e| PlatformError::Helper {
                tool: "wmctrl",
                source: e,
            })?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let window = find_window_for_pid(&listing, pid).ok_or(PlatformError::NoWindow { pid })?;

        let status = Command::new("wmctrl")
            .args(["-ia", window])
            .status()
            .map_err(|e| PlatformError::Helper {
                tool: "wmctrl",
                source: e,
            })?;
        helper_succeeded(status, pid)
    }

    fn wrap_in_terminal(&self, argv: &[String]) -> Option<Vec<String>> {
        if self.terminal.command.is_empty() {
            return None;
        }
        let mut wrapped = vec![self.terminal.command.clone()];
        wrapped.extend(self.terminal.args.iter().cloned());
        wrapped.extend(argv.iter().cloned());
        Some(wrapped)
    }
}

/// macOS: window activation through System Events.
///
/// Hosting is not offered. Terminal.app runs `do script` commands in its own
/// process tree and `osascript` returns at once, so nothing we could own
/// stays alive for the program's lifetime.
pub struct MacOs;

impl Platform for MacOs {
    fn name(&self) -> &str {
        "macos"
    }

    fn activate_window(&self, pid: u32, _hosted: bool) -> Result<(), PlatformError> {
        let script = format!(
            "tell application \"System Events\" to set frontmost of every process whose unix id is {pid} to true"
        );
        let status = Command::new("osascript")
            .args(["-e", &script])
            .status()
            .map_err(|e| PlatformError::Helper {
                tool: "osascript",
                source: e,
            })?;
        helper_succeeded(status, pid)
    }

    fn wrap_in_terminal(&self, _argv: &[String]) -> Option<Vec<String>> {
        None
    }
}

/// No desktop: nothing to activate, no terminal to host in.
pub struct Headless;

impl Platform for Headless {
    fn name(&self) -> &str {
        "headless"
    }

    fn activate_window(&self, _pid: u32, _hosted: bool) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    fn wrap_in_terminal(&self, _argv: &[String]) -> Option<Vec<String>> {
        None
    }
}

/// Pick the implementation for the platform we were built for.
pub fn detect(terminal: TerminalConfig) -> Box<dyn Platform> {
    if cfg!(target_os = "macos") {
        Box::new(MacOs)
    } else if cfg!(target_os = "linux") {
        Box::new(LinuxDesktop::new(terminal))
    } else {
        Box::new(Headless)
    }
}

/// Map a helper's exit status: a non-zero exit means it found nothing to raise.
fn helper_succeeded(status: ExitStatus, pid: u32) -> Result<(), PlatformError> {
    if status.success() {
        Ok(())
    } else {
        Err(PlatformError::NoWindow { pid })
    }
}

/// Find the window id in `wmctrl -lp` output whose pid column matches.
///
/// Each line reads `<window id> <desktop> <pid> <host> <title...>`.
fn find_window_for_pid(listing: &str, pid: u32) -> Option<&str> {
    listing.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        let id = cols.next()?;
        let _desktop = cols.next()?;
        let owner: u32 = cols.next()?.parse().ok()?;
        (owner == pid).then_some(id)
    })
}
