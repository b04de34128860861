/// Line-oriented console I/O and the start dialog that collects launch
/// options for a program.
use crate::resolve::{split_words, ParseError, PathResolver};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

/// What the user asked for when starting a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRequest {
    /// The dialog was aborted; do nothing.
    Cancelled,
    Options { options: Vec<String>, hosted: bool },
}

/// The three ways of supplying options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// A single file path passed as the only option.
    File,
    /// Free text split with shell quoting.
    Text,
    /// Free text, and run the program inside a terminal.
    Bash,
}

impl OptionKind {
    pub fn parse(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "file" | "f" => Some(OptionKind::File),
            "text" | "t" => Some(OptionKind::Text),
            "bash" | "b" | "terminal" => Some(OptionKind::Bash),
            _ => None,
        }
    }
}

/// Errors from the start dialog.
#[derive(Debug)]
pub enum DialogError {
    Parse(ParseError),
    Io(std::io::Error),
}

impl std::fmt::Display for DialogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogError::Parse(e) => write!(f, "invalid options: {e}"),
            DialogError::Io(e) => write!(f, "console I/O error: {e}"),
        }
    }
}

impl std::error::Error for DialogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DialogError::Parse(e) => Some(e),
            DialogError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for DialogError {
    fn from(e: std::io::Error) -> Self {
        DialogError::Io(e)
    }
}

impl From<ParseError> for DialogError {
    fn from(e: ParseError) -> Self {
        DialogError::Parse(e)
    }
}

/// Split free-text options. Blank text means no options.
pub fn parse_options(text: &str) -> Result<Vec<String>, ParseError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    split_words(text)
}

/// Prompted line input over any async reader/writer pair.
pub struct Console<R, W> {
    lines: Lines<R>,
    out: W,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, out: W) -> Self {
        Self {
            lines: reader.lines(),
            out,
        }
    }

    /// Next input line, `None` at end of input. Cancel safe.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Write `text` followed by a newline.
    pub async fn say(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }

    /// Show `prompt` and read the answer.
    pub async fn ask(&mut self, prompt: &str) -> std::io::Result<Option<String>> {
        self.out.write_all(prompt.as_bytes()).await?;
        self.out.write_all(b" ").await?;
        self.out.flush().await?;
        self.next_line().await
    }

    #[cfg(test)]
    pub fn into_writer(self) -> W {
        self.out
    }

    /// Run the start dialog for `label`.
    ///
    /// End of input at any question cancels.
    pub async fn ask_start_options(
        &mut self,
        label: &str,
        resolver: &PathResolver,
    ) -> Result<StartRequest, DialogError> {
        let Some(answer) = self
            .ask(&format!(
                "Start {label}: enter 'file' to pass a file, 'text' to enter options, or 'bash' to run in a terminal:"
            ))
            .await?
        else {
            return Ok(StartRequest::Cancelled);
        };

        let Some(kind) = OptionKind::parse(&answer) else {
            return Ok(StartRequest::Cancelled);
        };

        match kind {
            OptionKind::File => {
                let Some(path) = self.ask("Option file path:").await? else {
                    return Ok(StartRequest::Cancelled);
                };
                let path = path.trim();
                if !path.is_empty() {
                    return Ok(StartRequest::Options {
                        options: vec![resolver.absolutize(path)],
                        hosted: false,
                    });
                }
                let confirm = self
                    .ask("No file selected. Run without any options? [y/N]")
                    .await?
                    .unwrap_or_default();
                if matches!(confirm.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                    Ok(StartRequest::Options {
                        options: Vec::new(),
                        hosted: false,
                    })
                } else {
                    Ok(StartRequest::Cancelled)
                }
            }
            OptionKind::Text | OptionKind::Bash => {
                let prompt = if kind == OptionKind::Bash {
                    "Options (or leave empty):"
                } else {
                    "Options:"
                };
                let Some(text) = self.ask(prompt).await? else {
                    return Ok(StartRequest::Cancelled);
                };
                Ok(StartRequest::Options {
                    options: parse_options(&text)?,
                    hosted: kind == OptionKind::Bash,
                })
            }
        }
    }
}
