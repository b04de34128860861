/// Command-string resolution: turn what the user typed on the command line
/// into an absolute, launchable argument vector.
use crate::config::ResolverConfig;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// How a command string was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// `python3 script.py ...`: interpreter word followed by a script path.
    Interpreted,
    /// A file with a known script extension, run through its interpreter.
    Script,
    /// An existing file executed directly.
    Executable,
    /// Anything else, split with shell quoting rules and run as-is.
    ShellLine,
}

/// A resolved, non-empty argument vector. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    kind: CommandKind,
}

impl CommandSpec {
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Final argument vector for a launch: the resolved command followed by `options`.
    pub fn with_options(&self, options: &[String]) -> Vec<String> {
        self.argv.iter().chain(options).cloned().collect()
    }

    /// Short label: file name of the last non-flag token.
    pub fn display_name(&self) -> String {
        let token = self
            .argv
            .iter()
            .rev()
            .find(|t| !t.starts_with('-'))
            .unwrap_or(&self.argv[0]);
        Path::new(token)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| token.clone())
    }

    /// Shell-quoted form, for logs and terminal wrappers.
    pub fn command_line(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// Errors from splitting a command or option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing to run.
    Empty,
    /// Unbalanced quotes or a dangling escape.
    Quoting { input: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::Quoting { input } => {
                write!(f, "malformed quoting in {input:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Split `input` with POSIX shell quoting rules. Tokens are never dropped.
pub fn split_words(input: &str) -> Result<Vec<String>, ParseError> {
    shell_words::split(input).map_err(|_| ParseError::Quoting {
        input: input.to_string(),
    })
}

/// Resolves command strings relative to a fixed working directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    cwd: PathBuf,
    config: ResolverConfig,
}

/// Index of the script path in an interpreter command line, if there is one.
///
/// `-m module`, `-c code` and `-` (stdin) take the place of a script, so no
/// later token is a path. `-W` and `-X` consume the next token.
fn script_operand(argv: &[String]) -> Option<usize> {
    let mut tokens = argv.iter().enumerate().skip(1);
    while let Some((idx, token)) = tokens.next() {
        match token.as_str() {
            "-" => return None,
            "--" => return tokens.next().map(|(idx, _)| idx),
            "-W" | "-X" => {
                tokens.next();
            }
            t if t.starts_with("-m") || t.starts_with("-c") => return None,
            t if t.starts_with('-') => {}
            _ => return Some(idx),
        }
    }
    None
}

impl PathResolver {
    /// Resolver anchored at the process's current directory.
    pub fn new(config: ResolverConfig) -> std::io::Result<Self> {
        Ok(Self::with_cwd(std::env::current_dir()?, config))
    }

    pub fn with_cwd(cwd: PathBuf, config: ResolverConfig) -> Self {
        Self { cwd, config }
    }

    /// Classify `raw` and build its [`CommandSpec`].
    ///
    /// Checked in order: interpreter prefix, whole string as a script file,
    /// whole string as an existing file, then shell tokenisation (where the
    /// first token may itself be a script or an existing file).
    pub fn resolve(&self, raw: &str) -> Result<CommandSpec, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let first_word = trimmed.split_whitespace().next().unwrap_or(trimmed);
        if first_word != trimmed && self.is_interpreter(first_word) {
            let mut argv = split_words(trimmed)?;
            if let Some(idx) = script_operand(&argv) {
                argv[idx] = self.absolutize(&argv[idx]);
            }
            return Ok(CommandSpec {
                argv,
                kind: CommandKind::Interpreted,
            });
        }

        let has_space = trimmed.contains(char::is_whitespace);
        if let Some(interpreter) = self.script_interpreter(trimmed) {
            if !has_space || self.is_file(trimmed) {
                return Ok(CommandSpec {
                    argv: vec![interpreter.to_string(), self.absolutize(trimmed)],
                    kind: CommandKind::Script,
                });
            }
        }

        if self.is_file(trimmed) {
            return Ok(CommandSpec {
                argv: vec![self.absolutize(trimmed)],
                kind: CommandKind::Executable,
            });
        }

        let tokens = split_words(trimmed)?;
        let Some((first, rest)) = tokens.split_first() else {
            return Err(ParseError::Empty);
        };

        if let Some(interpreter) = self.script_interpreter(first) {
            let mut argv = vec![interpreter.to_string(), self.absolutize(first)];
            argv.extend_from_slice(rest);
            return Ok(CommandSpec {
                argv,
                kind: CommandKind::Script,
            });
        }

        if self.is_file(first) {
            let mut argv = vec![self.absolutize(first)];
            argv.extend_from_slice(rest);
            return Ok(CommandSpec {
                argv,
                kind: CommandKind::Executable,
            });
        }

        Ok(CommandSpec {
            argv: tokens,
            kind: CommandKind::ShellLine,
        })
    }

    /// Absolute, lexically normalised form of `path`.
    pub fn absolutize(&self, path: &str) -> String {
        normalize(&self.cwd.join(path))
            .to_string_lossy()
            .into_owned()
    }

    fn is_interpreter(&self, word: &str) -> bool {
        let name = Path::new(word)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(word);
        self.config.interpreters.iter().any(|i| i == name)
    }

    fn script_interpreter(&self, path: &str) -> Option<&str> {
        let ext = Path::new(path).extension()?.to_str()?;
        self.config.script_extensions.get(ext).map(String::as_str)
    }

    fn is_file(&self, path: &str) -> bool {
        self.cwd.join(path).is_file()
    }
}

/// Drop `.` components and fold `..` into their parent without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
