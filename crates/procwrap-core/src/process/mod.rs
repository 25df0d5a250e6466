//! Managed child processes.
//!
//! A [`ManagedProcessHandle`] wraps one launch of a [`ProcessSpec`]:
//!
//! 1. **Start** spawns the child in its own process group and optionally
//!    drains stdout/stderr into [`OutputStreams`]
//! 2. **Exit** is observed by a watcher thread that reaps the child and
//!    resolves both `wait_for_exit` and the `completion()` future
//! 3. **Cancel** terminates the whole process tree, at most once, whether it
//!    is requested directly, through the handle's token, or through an
//!    external token
//! 4. **Dispose** cancels and makes the handle permanently inert
//!
//! # Example
//!
//! ```rust,no_run
//! use procwrap_core::{CancellationToken, CaptureOptions, ManagedProcessHandle, ProcessSpec};
//! use std::time::Duration;
//!
//! fn main() -> procwrap_core::Result<()> {
//!     let shutdown = CancellationToken::new();
//!     let handle = ManagedProcessHandle::new(ProcessSpec::new("make").arg("-j8"));
//!     handle.register_external_cancellation(&shutdown)?;
//!     handle.start(CaptureOptions::none())?;
//!
//!     if !handle.wait_for_exit(Some(Duration::from_secs(600)))? {
//!         shutdown.cancel();
//!     }
//!     Ok(())
//! }
//! ```

mod exit;
mod handle;
mod output;
mod spec;

pub use exit::exit_code_of;
pub use handle::{ManagedProcessHandle, ProcessState};
pub use output::{CaptureOptions, CollectedOutput, OutputEvent, OutputSource, OutputStreams};
pub use spec::ProcessSpec;
