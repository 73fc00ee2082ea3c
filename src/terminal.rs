//! Per-channel line terminal.
//!
//! Wraps one session channel with a prompt and a byte-level line editor,
//! feeding completed lines to the shell and framing results and errors
//! back to the client. Lives for the duration of one pty-backed session.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use russh::server::Msg;
use russh::{Channel, ChannelMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Error;
use crate::shell::{CommandContext, Shell};

const PROMPT: &str = "> ";
const DEFAULT_WINDOW: (u32, u32) = (80, 24);
/// Lets the pty drain command output before the prompt redraw.
const OUTPUT_SETTLE: Duration = Duration::from_micros(1);
const STDERR: u32 = 1;
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub struct Terminal {
    channel: Channel<Msg>,
    shell: Arc<Shell>,
    ctx: CommandContext,
    editor: LineEditor,
    window: (u32, u32),
}

impl Terminal {
    pub fn new(channel: Channel<Msg>, shell: Arc<Shell>, ctx: CommandContext) -> Self {
        Self {
            channel,
            shell,
            ctx,
            editor: LineEditor::new(),
            window: DEFAULT_WINDOW,
        }
    }

    pub fn set_window(&mut self, cols: u32, rows: u32) {
        self.window = (cols, rows);
    }

    /// Drive the terminal until the session ends, then close the channel.
    /// The close happens on every exit path, exactly once; a racing close
    /// from the peer turns it into a no-op.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(user = %self.ctx.user, "user shell started");
        if let Err(err) = self.serve(&cancel).await {
            error!(%err, "terminal loop ended with error");
        }
        if self.channel.close().await.is_err() {
            debug!("channel already closed");
        }
        debug!(user = %self.ctx.user, "user shell finished");
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        self.write(PROMPT).await?;
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = self.channel.wait() => msg,
            };
            // end of stream is normal termination
            let Some(msg) = msg else { return Ok(()) };
            match msg {
                ChannelMsg::Data { data } => {
                    if !self.handle_input(&data).await? {
                        return Ok(());
                    }
                }
                ChannelMsg::Eof | ChannelMsg::Close => return Ok(()),
                ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    ..
                } => {
                    self.window = (col_width, row_height);
                    debug!(cols = self.window.0, rows = self.window.1, "window resized");
                }
                _ => {}
            }
        }
    }

    /// Feed raw bytes through the editor. Returns Ok(false) when the user
    /// asked to leave.
    async fn handle_input(&mut self, data: &[u8]) -> Result<bool, Error> {
        for &byte in data {
            let mut echo = String::new();
            let line = self.editor.feed(byte, &mut echo);
            if !echo.is_empty() {
                self.write(&echo).await?;
            }
            if let Some(line) = line {
                match line.as_str() {
                    "exit" => return Ok(false),
                    "" => self.write(PROMPT).await?,
                    _ => self.execute(&line).await?,
                }
            }
        }
        Ok(true)
    }

    async fn execute(&mut self, line: &str) -> Result<(), Error> {
        debug!(line, "terminal input");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.shell.execute(&self.ctx, line)));
        match outcome {
            Ok(Ok(result)) if !result.is_empty() => self.send_result(&result).await,
            Ok(Ok(_)) => self.write(PROMPT).await,
            Ok(Err(err)) => self.send_error(&err).await,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%reason, line, "caught panic in command handler");
                self.write(PROMPT).await
            }
        }
    }

    async fn send_result(&mut self, result: &[u8]) -> Result<(), Error> {
        self.channel.data(result).await?;
        tokio::time::sleep(OUTPUT_SETTLE).await;
        self.write("\r\n").await?;
        self.write(PROMPT).await
    }

    async fn send_error(&mut self, err: &Error) -> Result<(), Error> {
        let message = format!("{RED}Error executing command:\r\n\t{err}{RESET}");
        self.channel
            .extended_data(STDERR, message.as_bytes())
            .await?;
        tokio::time::sleep(OUTPUT_SETTLE).await;
        self.write("\r\n").await?;
        self.write(PROMPT).await
    }

    async fn write(&self, text: &str) -> Result<(), Error> {
        self.channel.data(text.as_bytes()).await?;
        Ok(())
    }
}

/// Minimal line editor: printable echo, backspace erase, CR submit.
struct LineEditor {
    buffer: String,
    last_cr: bool,
}

impl LineEditor {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            last_cr: false,
        }
    }

    /// Feed one byte; appends any echo bytes for the client and returns a
    /// completed line on CR/LF.
    fn feed(&mut self, byte: u8, echo: &mut String) -> Option<String> {
        match byte {
            b'\r' | b'\n' => {
                // swallow the LF of a CRLF pair
                if byte == b'\n' && self.last_cr {
                    self.last_cr = false;
                    return None;
                }
                self.last_cr = byte == b'\r';
                echo.push_str("\r\n");
                Some(std::mem::take(&mut self.buffer))
            }
            0x7f | 0x08 => {
                self.last_cr = false;
                if self.buffer.pop().is_some() {
                    echo.push_str("\x08 \x08");
                }
                None
            }
            0x20..=0x7e => {
                self.last_cr = false;
                self.buffer.push(byte as char);
                echo.push(byte as char);
                None
            }
            _ => {
                self.last_cr = false;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(editor: &mut LineEditor, input: &[u8]) -> (Vec<String>, String) {
        let mut lines = Vec::new();
        let mut echo = String::new();
        for &byte in input {
            if let Some(line) = editor.feed(byte, &mut echo) {
                lines.push(line);
            }
        }
        (lines, echo)
    }

    #[test]
    fn carriage_return_completes_a_line() {
        let mut editor = LineEditor::new();
        let (lines, echo) = feed_all(&mut editor, b"echo hi\r");
        assert_eq!(lines, vec!["echo hi".to_string()]);
        assert_eq!(echo, "echo hi\r\n");
    }

    #[test]
    fn crlf_yields_a_single_line() {
        let mut editor = LineEditor::new();
        let (lines, _) = feed_all(&mut editor, b"one\r\ntwo\r\n");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn backspace_erases_and_echoes() {
        let mut editor = LineEditor::new();
        let (lines, echo) = feed_all(&mut editor, b"ab\x7f\r");
        assert_eq!(lines, vec!["a".to_string()]);
        assert!(echo.contains("\x08 \x08"));
    }

    #[test]
    fn backspace_on_empty_buffer_is_silent() {
        let mut editor = LineEditor::new();
        let mut echo = String::new();
        assert!(editor.feed(0x7f, &mut echo).is_none());
        assert!(echo.is_empty());
    }

    #[test]
    fn control_bytes_are_ignored() {
        let mut editor = LineEditor::new();
        let (lines, echo) = feed_all(&mut editor, b"\x01\x02a\x03\r");
        assert_eq!(lines, vec!["a".to_string()]);
        assert_eq!(echo, "a\r\n");
    }

    #[test]
    fn empty_line_submits_empty_string() {
        let mut editor = LineEditor::new();
        let (lines, _) = feed_all(&mut editor, b"\r");
        assert_eq!(lines, vec![String::new()]);
    }
}
