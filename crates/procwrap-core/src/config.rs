//! Centralized configuration for procwrap.
//!
//! Constants for stream draining, termination timing and exit-code mapping.

use std::time::Duration;

/// Configuration for managed processes.
pub struct ProcessConfig;

impl ProcessConfig {
    /// Bytes requested per read from a captured stdout/stderr pipe.
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Default grace period between polite termination and a forced kill.
    /// Zero kills the process tree immediately.
    pub const DEFAULT_KILL_GRACE: Duration = Duration::ZERO;

    /// Offset added to a terminating signal number (shell convention).
    pub const SIGNAL_EXIT_CODE_BASE: i32 = 128;

    /// Exit code reported when the OS gives neither a code nor a signal.
    pub const UNKNOWN_EXIT_CODE: i32 = -1;
}

/// Thread names used for the background work of a handle.
pub struct ThreadNames;

impl ThreadNames {
    pub const STDOUT_DRAIN: &'static str = "procwrap-stdout";
    pub const STDERR_DRAIN: &'static str = "procwrap-stderr";
    pub const EXIT_WATCHER: &'static str = "procwrap-exit";
    pub const KILL_ESCALATION: &'static str = "procwrap-escalate";
}
