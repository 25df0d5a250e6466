//! Procwrap Core - managed child processes for IDE and CLI hosts.
//!
//! This crate launches external tools and supervises them: it captures their
//! output as text, reports their exit code both synchronously and as a future,
//! and cancels whole process trees cooperatively and idempotently.
//!
//! # Example
//!
//! ```rust,no_run
//! use procwrap_core::{CaptureOptions, ManagedProcessHandle, ProcessSpec};
//!
//! # async fn build() -> procwrap_core::Result<()> {
//! let (handle, mut streams) = ManagedProcessHandle::launch(
//!     ProcessSpec::new("dotnet").arg("build"),
//!     CaptureOptions::stdout_only(),
//! )?;
//!
//! if let Some(stdout) = streams.stdout.as_mut() {
//!     while let Some(event) = stdout.recv().await {
//!         print!("{}", event.text);
//!     }
//! }
//! let code = handle.completion().await?;
//! println!("build finished with {code}");
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod platform;
pub mod process;

// Re-export commonly used types
pub use cancel::{CancellationRegistration, CancellationToken};
pub use config::ProcessConfig;
pub use error::{ProcwrapError, Result};
pub use process::{
    CaptureOptions, CollectedOutput, ManagedProcessHandle, OutputEvent, OutputSource,
    OutputStreams, ProcessSpec, ProcessState,
};
