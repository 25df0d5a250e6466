//! Platform abstraction layer for cross-platform compatibility.
//!
//! All `#[cfg]` blocks for OS-specific process behavior live here rather than
//! in the handle itself.
//!
//! # Supported Platforms
//!
//! - **Linux/macOS**: process groups and `killpg`
//! - **Windows**: new process groups and `taskkill /T`

pub mod process;

pub use process::{
    has_terminated, place_in_new_group, signal_process_tree, wait_for_termination,
    TerminationSignal,
};
