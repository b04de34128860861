//! Size probes: report a resource's size as the formatted string a tool like
//! `du -sh` prints. Two samples are "the same size" iff the strings match.
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Errors from a single probe. All of them are transient: the sampler logs
/// and tries again on the next interval.
#[derive(Debug)]
pub enum ProbeError {
    /// The probe command is empty.
    NoCommand,
    /// The probe command could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The probe ran but failed.
    Failed { status: ExitStatus, stderr: String },
    /// The probe printed nothing usable.
    NoOutput,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::NoCommand => write!(f, "no probe command configured"),
            ProbeError::Spawn { program, source } => {
                write!(f, "failed to run {program}: {source}")
            }
            ProbeError::Failed { status, stderr } => {
                write!(f, "probe exited with {status}: {}", stderr.trim())
            }
            ProbeError::NoOutput => write!(f, "probe produced no output"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Anything that can report a formatted size for a path. Blocking.
pub trait SizeProbe {
    fn sample(&mut self, path: &Path) -> Result<String, ProbeError>;
}

/// Runs an external command with the path appended and takes the first
/// whitespace-separated field of its output.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(argv: &[String]) -> Result<Self, ProbeError> {
        let (program, args) = argv.split_first().ok_or(ProbeError::NoCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SizeProbe for CommandProbe {
    fn sample(&mut self, path: &Path) -> Result<String, ProbeError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .map_err(|e| ProbeError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        parse_size(&String::from_utf8_lossy(&output.stdout)).ok_or(ProbeError::NoOutput)
    }
}

/// First field of the probe output, e.g. `12M` from `12M\t/data/run.dat`.
pub fn parse_size(stdout: &str) -> Option<String> {
    stdout.split_whitespace().next().map(str::to_string)
}
