//! Interactive side of an alert: sound the cue, ask the user, return the
//! acknowledgement.
use crate::detector::{Acknowledgement, AlertRequest};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

/// Audible cue played when an alert is raised.
pub trait AlertSound {
    fn play(&self);
}

/// ASCII BEL on stderr.
pub struct TerminalBell;

impl AlertSound for TerminalBell {
    fn play(&self) {
        let mut err = std::io::stderr();
        let _ = err.write_all(b"\x07");
        let _ = err.flush();
    }
}

pub struct Silent;

impl AlertSound for Silent {
    fn play(&self) {}
}

/// Map a typed answer to an acknowledgement. `None` means "ask again".
pub fn parse_answer(answer: &str) -> Option<Acknowledgement> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "o" | "ok" | "stop" => Some(Acknowledgement::Stop),
        "c" | "cancel" | "continue" => Some(Acknowledgement::Continue),
        _ => None,
    }
}

/// Prompts on `out`, reads answers from `input`.
pub struct AlertHandler<R, W> {
    input: Lines<R>,
    out: W,
    sound: Box<dyn AlertSound>,
}

impl<R, W> AlertHandler<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, out: W, sound: Box<dyn AlertSound>) -> Self {
        Self {
            input: input.lines(),
            out,
            sound,
        }
    }

    /// Present the alert and wait for an answer. End of input means Stop.
    pub async fn ask(&mut self, request: &AlertRequest) -> std::io::Result<Acknowledgement> {
        self.sound.play();
        let warning = format!(
            "Issue with the file! {} has not grown (size {}).\n",
            request.path.display(),
            request.size
        );
        self.out.write_all(warning.as_bytes()).await?;

        loop {
            self.out
                .write_all(b"[o]k to stop monitoring, [c]ancel to keep watching: ")
                .await?;
            self.out.flush().await?;

            let Some(line) = self.input.next_line().await? else {
                tracing::info!("no more input, stopping");
                return Ok(Acknowledgement::Stop);
            };
            if let Some(ack) = parse_answer(&line) {
                return Ok(ack);
            }
        }
    }

    #[cfg(test)]
    fn into_writer(self) -> W {
        self.out
    }
}
