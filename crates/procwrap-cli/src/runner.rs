//! Runs one tool to completion, forwarding its output.

use anyhow::{Context, Result};
use procwrap_core::{
    CancellationToken, CaptureOptions, ManagedProcessHandle, OutputEvent, OutputSource,
    ProcessSpec,
};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// Exit code reported when the tool was cancelled by `--timeout`,
/// matching coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Exited,
    Interrupted,
    TimedOut,
}

/// Run `spec` until it exits, is interrupted, or `timeout` elapses.
///
/// Returns the exit code this process should report.
pub async fn run(spec: ProcessSpec, timeout: Option<Duration>) -> Result<i32> {
    let shutdown = CancellationToken::new();
    let handle = ManagedProcessHandle::new(spec);
    handle.register_external_cancellation(&shutdown)?;

    let mut streams = handle
        .start(CaptureOptions::all())
        .context("Failed to start tool")?;
    let stdout = tokio::spawn(forward(streams.stdout.take()));
    let stderr = tokio::spawn(forward(streams.stderr.take()));

    let reason = tokio::select! {
        _ = handle.completion() => StopReason::Exited,
        Ok(()) = tokio::signal::ctrl_c() => StopReason::Interrupted,
        _ = deadline(timeout) => StopReason::TimedOut,
    };
    if reason != StopReason::Exited {
        warn!(pid = ?handle.process_id(), ?reason, "Cancelling tool");
        shutdown.cancel();
    }

    let code = handle.completion().await?;
    for forwarder in [stdout, stderr] {
        forwarder.await?.context("Failed to forward tool output")?;
    }
    info!(code, ?reason, "Tool finished");

    Ok(match reason {
        StopReason::TimedOut => TIMEOUT_EXIT_CODE,
        StopReason::Exited | StopReason::Interrupted => code,
    })
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Copy events to our own stdout/stderr until the stream closes.
async fn forward(receiver: Option<UnboundedReceiver<OutputEvent>>) -> std::io::Result<()> {
    let Some(mut receiver) = receiver else {
        return Ok(());
    };
    while let Some(event) = receiver.recv().await {
        emit(&event)?;
    }
    Ok(())
}

fn emit(event: &OutputEvent) -> std::io::Result<()> {
    match event.source {
        OutputSource::Stdout => write_chunk(&mut std::io::stdout().lock(), &event.text),
        OutputSource::Stderr => write_chunk(&mut std::io::stderr().lock(), &event.text),
    }
}

fn write_chunk(out: &mut impl Write, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_passes_through() {
        let spec = ProcessSpec::new("sh").args(["-c", "exit 5"]);
        assert_eq!(run(spec, None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_timeout_cancels_tool() {
        let spec = ProcessSpec::new("sleep").arg("30");
        let code = run(spec, Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_launch_failure_is_error() {
        let spec = ProcessSpec::new("/nonexistent/procwrap-tool");
        assert!(run(spec, None).await.is_err());
    }

    #[test]
    fn test_write_chunk() {
        let mut buffer = Vec::new();
        write_chunk(&mut buffer, "héllo\n").unwrap();
        assert_eq!(buffer, "héllo\n".as_bytes());
    }
}
