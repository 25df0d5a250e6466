//! Output capture for managed processes.
//!
//! Captured pipes are drained on dedicated threads. Each drain decodes bytes as
//! UTF-8 incrementally and forwards text chunks over an unbounded channel, so a
//! slow consumer never stalls the child on a full pipe.

use crate::config::ProcessConfig;
use crate::error::ProcwrapError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{ErrorKind, Read};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Which standard stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSource::Stdout => f.write_str("stdout"),
            OutputSource::Stderr => f.write_str("stderr"),
        }
    }
}

/// A decoded chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub source: OutputSource,
    pub text: String,
}

/// Which streams to capture when starting a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    pub stdout: bool,
    pub stderr: bool,
}

impl CaptureOptions {
    /// Capture nothing; both streams are discarded.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            stdout: true,
            stderr: true,
        }
    }

    pub fn stdout_only() -> Self {
        Self {
            stdout: true,
            stderr: false,
        }
    }

    pub fn stderr_only() -> Self {
        Self {
            stdout: false,
            stderr: true,
        }
    }
}

/// Receivers for the streams captured by [`ManagedProcessHandle::start`].
///
/// Each receiver yields chunks in write order and closes once its stream
/// reaches end-of-file.
///
/// [`ManagedProcessHandle::start`]: crate::process::ManagedProcessHandle::start
#[derive(Debug, Default)]
pub struct OutputStreams {
    pub stdout: Option<UnboundedReceiver<OutputEvent>>,
    pub stderr: Option<UnboundedReceiver<OutputEvent>>,
}

/// Everything a process wrote to its captured streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl OutputStreams {
    /// Wait for both streams to close and concatenate their text.
    pub async fn collect(self) -> CollectedOutput {
        CollectedOutput {
            stdout: read_to_end(self.stdout).await,
            stderr: read_to_end(self.stderr).await,
        }
    }
}

async fn read_to_end(receiver: Option<UnboundedReceiver<OutputEvent>>) -> String {
    let mut text = String::new();
    if let Some(mut receiver) = receiver {
        while let Some(event) = receiver.recv().await {
            text.push_str(&event.text);
        }
    }
    text
}

/// Incremental UTF-8 decoder that never splits a character across chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    /// Decode as much of `pending + bytes` as possible. An incomplete
    /// character at the end is kept for the next call; invalid sequences
    /// become U+FFFD.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut input: &[u8] = &self.pending;
        while !input.is_empty() {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - input.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is left at end-of-stream.
    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Read `reader` until end-of-stream, forwarding decoded text to `sender`.
///
/// Read errors end the loop; they never affect the process itself. When the
/// receiver is gone the pipe is still drained so the child cannot block.
pub(crate) fn drain_stream<R: Read>(
    mut reader: R,
    source: OutputSource,
    pid: u32,
    sender: UnboundedSender<OutputEvent>,
) {
    let mut buffer = [0u8; ProcessConfig::READ_BUFFER_SIZE];
    let mut decoder = Utf8ChunkDecoder::default();

    let send = |text: String| {
        if !text.is_empty() {
            let _ = sender.send(OutputEvent { source, text });
        }
    };

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => send(decoder.decode(&buffer[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let err = ProcwrapError::StreamRead {
                    stream: source,
                    pid,
                    source: e,
                };
                debug!(pid, stream = %source, "{}", err);
                break;
            }
        }
    }

    send(decoder.finish());
    debug!(pid, stream = %source, "Output drain finished");
}
