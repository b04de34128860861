/// The supervision table: every program named on the command line, polled on
/// a fixed cadence, with diffed status-change events for the presenter.
use crate::platform::Platform;
use crate::process::{
    LaunchError, ManagedProcess, ProcessState, StartOutcome, StopOutcome, StopPolicy,
};
use crate::resolve::{ParseError, PathResolver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;

/// Emitted only when a program's state actually changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub old: ProcessState,
    pub new: ProcessState,
    pub at: DateTime<Utc>,
}

/// Renderable row for one program.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramStatus {
    pub index: usize,
    pub name: String,
    pub label: String,
    pub command: String,
    pub status: ProcessState,
    pub pid: Option<u32>,
    pub hosted: bool,
}

/// Errors from registry commands.
#[derive(Debug)]
pub enum RegistryError {
    /// No program matches the given name.
    UnknownProgram(String),
    /// A command string on the command line could not be parsed.
    Parse { name: String, source: ParseError },
    /// The program could not be launched.
    Launch { name: String, source: LaunchError },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownProgram(name) => write!(f, "unknown program: {name}"),
            RegistryError::Parse { name, source } => write!(f, "cannot parse {name:?}: {source}"),
            RegistryError::Launch { source, .. } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::UnknownProgram(_) => None,
            RegistryError::Parse { source, .. } => Some(source),
            RegistryError::Launch { source, .. } => Some(source),
        }
    }
}

struct Entry {
    process: ManagedProcess,
    reported: ProcessState,
}

/// Owns every [`ManagedProcess`]. Membership is fixed at construction.
pub struct StatusRegistry {
    table: BTreeMap<String, Entry>,
    platform: Box<dyn Platform>,
    stop_policy: StopPolicy,
    events: UnboundedSender<StatusChange>,
}

impl StatusRegistry {
    /// Resolve every command string and build the table. Duplicate strings
    /// collapse into one entry.
    pub fn new(
        programs: &[String],
        resolver: &PathResolver,
        platform: Box<dyn Platform>,
        stop_policy: StopPolicy,
        events: UnboundedSender<StatusChange>,
    ) -> Result<Self, RegistryError> {
        let mut table = BTreeMap::new();
        for raw in programs {
            let spec = resolver.resolve(raw).map_err(|e| RegistryError::Parse {
                name: raw.clone(),
                source: e,
            })?;
            tracing::debug!(program = %raw, argv = ?spec.argv(), kind = ?spec.kind(), "resolved");
            table.insert(
                raw.clone(),
                Entry {
                    process: ManagedProcess::new(raw.clone(), spec),
                    reported: ProcessState::Stopped,
                },
            );
        }
        Ok(Self {
            table,
            platform,
            stop_policy,
            events,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Display label for a program, falling back to its name.
    pub fn label(&self, name: &str) -> String {
        self.table
            .get(name)
            .map(|e| e.process.spec().display_name())
            .unwrap_or_else(|| name.to_string())
    }

    /// Find a program by 1-based index, exact command string, or unique
    /// display label.
    pub fn lookup(&self, target: &str) -> Option<&str> {
        let target = target.trim();
        if let Ok(index) = target.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| self.table.keys().nth(i))
                .map(String::as_str);
        }
        if let Some((key, _)) = self.table.get_key_value(target) {
            return Some(key.as_str());
        }
        let mut matches = self
            .table
            .iter()
            .filter(|(_, e)| e.process.spec().display_name() == target);
        match (matches.next(), matches.next()) {
            (Some((key, _)), None) => Some(key.as_str()),
            _ => None,
        }
    }

    /// Poll every program and emit a change for each one whose state moved.
    /// Returns the number of changes emitted.
    pub fn tick(&mut self) -> usize {
        let names: Vec<String> = self.table.keys().cloned().collect();
        names
            .iter()
            .filter(|name| self.refresh(name).is_some())
            .count()
    }

    pub fn start(
        &mut self,
        name: &str,
        options: &[String],
        hosted: bool,
    ) -> Result<StartOutcome, RegistryError> {
        let platform = self.platform.as_ref();
        let entry = self
            .table
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownProgram(name.to_string()))?;
        let result = entry
            .process
            .start(options, hosted, platform)
            .map_err(|e| RegistryError::Launch {
                name: name.to_string(),
                source: e,
            });
        self.refresh(name);
        result
    }

    pub async fn stop(&mut self, name: &str) -> Result<StopOutcome, RegistryError> {
        let policy = self.stop_policy;
        let entry = self.entry_mut(name)?;
        let outcome = entry.process.stop(policy).await;
        self.refresh(name);
        Ok(outcome)
    }

    /// Stop every running program.
    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self.table.keys().cloned().collect();
        for name in names {
            if let Ok(StopOutcome::Stopped { forced }) = self.stop(&name).await {
                tracing::info!(program = %name, forced, "stopped on exit");
            }
        }
    }

    pub fn bring_to_front(&mut self, name: &str) -> Result<(), RegistryError> {
        let platform = self.platform.as_ref();
        let entry = self
            .table
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownProgram(name.to_string()))?;
        entry.process.bring_to_front(platform);
        Ok(())
    }

    /// Current rows, in table order.
    pub fn snapshot(&self) -> Vec<ProgramStatus> {
        self.table
            .iter()
            .enumerate()
            .map(|(i, (name, entry))| ProgramStatus {
                index: i + 1,
                name: name.clone(),
                label: entry.process.spec().display_name(),
                command: entry.process.spec().command_line(),
                status: entry.reported,
                pid: entry.process.pid(),
                hosted: entry.process.hosted(),
            })
            .collect()
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut Entry, RegistryError> {
        self.table
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownProgram(name.to_string()))
    }

    /// Re-derive one program's state and emit a change if it moved.
    fn refresh(&mut self, name: &str) -> Option<StatusChange> {
        let entry = self.table.get_mut(name)?;
        let new = entry.process.check_status();
        if new == entry.reported {
            return None;
        }
        let change = StatusChange {
            name: name.to_string(),
            old: entry.reported,
            new,
            at: Utc::now(),
        };
        entry.reported = new;
        tracing::debug!(program = %name, old = %change.old, new = %change.new, "status changed");
        if self.events.send(change.clone()).is_err() {
            tracing::debug!("status listener gone, change dropped");
        }
        Some(change)
    }
}
