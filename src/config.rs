use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from procsentry.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SentryConfig {
    pub supervisor: SupervisorConfig,
    pub stop: StopConfig,
    pub terminal: TerminalConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub stop_on_exit: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub grace_period_ms: u64,
    pub poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Leading words treated as "interpreter + script".
    pub interpreters: Vec<String>,
    /// Script extension (without dot) -> interpreter used to run it.
    pub script_extensions: BTreeMap<String, String>,
}

/// CLI values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub poll_interval_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub terminal: Option<String>,
}

// --- Default implementations ---

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stop_on_exit: false,
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3000,
            poll_ms: 50,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command: "xfce4-terminal".to_string(),
            // Without --disable-server the launcher hands off to a running
            // instance and exits, leaving no pid that owns the program.
            args: vec!["--disable-server".to_string(), "-x".to_string()],
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            interpreters: vec!["python".to_string(), "python3".to_string()],
            script_extensions: BTreeMap::from([("py".to_string(), "python3".to_string())]),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl StopConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

impl SentryConfig {
    /// Load the config file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply command-line overrides on top of the loaded values.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(ms) = overrides.poll_interval_ms {
            self.supervisor.poll_interval_ms = ms;
        }
        if let Some(ms) = overrides.grace_period_ms {
            self.stop.grace_period_ms = ms;
        }
        if let Some(terminal) = overrides.terminal {
            self.terminal.command = terminal;
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
