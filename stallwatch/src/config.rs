use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Seconds between size probes.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Probe command; the watched path is appended as the last argument.
    #[serde(default = "default_probe")]
    pub probe: Vec<String>,
    /// Ring the terminal bell when an alert is raised.
    #[serde(default = "default_bell")]
    pub bell: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            probe: default_probe(),
            bell: default_bell(),
        }
    }
}

fn default_interval() -> u64 {
    1
}
fn default_probe() -> Vec<String> {
    vec!["du".to_string(), "-sh".to_string()]
}
fn default_bell() -> bool {
    true
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Load `stallwatch.toml` from `dir`. A missing file means defaults; an
/// unreadable or malformed one is reported and also falls back to defaults.
pub fn load_config(dir: &Path) -> WatchConfig {
    let path = dir.join("stallwatch.toml");
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return WatchConfig::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return WatchConfig::default();
        }
    };
    toml::from_str(&contents).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        WatchConfig::default()
    })
}
