//! Platform-specific process primitives.
//!
//! Every managed child is started as the leader of its own process group, so
//! signalling the group reaches the whole process tree the child spawns.

use crate::error::{ProcwrapError, Result};
use std::process::{Child, Command};
use tracing::debug;

/// How hard to ask a process tree to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGTERM on Unix, `taskkill /T` on Windows.
    Polite,
    /// SIGKILL on Unix, `taskkill /T /F` on Windows.
    Forced,
}

/// Block until `child` has terminated, leaving it unreaped.
///
/// An unreaped child keeps its pid, so its process group can still be
/// signalled without hitting a recycled id. Returns `Ok(false)` where the
/// platform cannot wait without reaping; the caller then reaps directly.
///
/// # Platform Behavior
/// - **Linux/FreeBSD/Android**: `waitid(P_PID, WEXITED | WNOWAIT)`
/// - **Windows**: waits on the process handle, which stays open until the
///   `Child` is dropped
/// - **Others**: returns `Ok(false)` immediately
pub fn wait_for_termination(child: &mut Child) -> Result<bool> {
    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        all(target_os = "linux", not(target_env = "uclibc")),
    ))]
    {
        use nix::errno::Errno;
        use nix::sys::wait::{waitid, Id, WaitPidFlag};

        let pid = child.id();
        let raw = to_nix_pid(pid).ok_or_else(|| ProcwrapError::Finalization {
            pid,
            message: "pid out of range".to_string(),
        })?;
        loop {
            match waitid(Id::Pid(raw), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(ProcwrapError::Finalization {
                        pid,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    #[cfg(windows)]
    {
        child.wait()?;
        Ok(true)
    }

    #[cfg(not(any(
        windows,
        target_os = "android",
        target_os = "freebsd",
        all(target_os = "linux", not(target_env = "uclibc")),
    )))]
    {
        let _ = child;
        Ok(false)
    }
}

/// Whether the unreaped child `pid` has already terminated.
///
/// Only meaningful for a child of this process that nobody has reaped yet.
/// Platforms without a non-reaping poll report `false`.
pub fn has_terminated(pid: u32) -> bool {
    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        all(target_os = "linux", not(target_env = "uclibc")),
    ))]
    {
        use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};

        let Some(raw) = to_nix_pid(pid) else {
            return false;
        };
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
        matches!(
            waitid(Id::Pid(raw), flags),
            Ok(status) if status != WaitStatus::StillAlive
        )
    }

    #[cfg(not(any(
        target_os = "android",
        target_os = "freebsd",
        all(target_os = "linux", not(target_env = "uclibc")),
    )))]
    {
        let _ = pid;
        false
    }
}

/// Configure `cmd` so the spawned child leads a new process group.
pub fn place_in_new_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = cmd;
    }
}

/// Send `signal` to the process tree rooted at `pid`.
///
/// A tree that is already gone counts as success.
///
/// # Platform Behavior
/// - **Linux/macOS**: `killpg(pid, ...)`; `pid` must be a group leader, which
///   [`place_in_new_group`] guarantees for managed children
/// - **Windows**: `taskkill /PID {pid} /T`, plus `/F` when forced
pub fn signal_process_tree(pid: u32, signal: TerminationSignal) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};

        let raw = to_nix_pid(pid).ok_or_else(|| ProcwrapError::CancellationFailed {
            pid,
            message: "pid out of range".to_string(),
        })?;
        let sig = match signal {
            TerminationSignal::Polite => Signal::SIGTERM,
            TerminationSignal::Forced => Signal::SIGKILL,
        };

        debug!(pid, signal = ?sig, "Signalling process group");
        match killpg(raw, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcwrapError::CancellationFailed {
                pid,
                message: e.to_string(),
            }),
        }
    }

    #[cfg(windows)]
    {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if signal == TerminationSignal::Forced {
            args.push("/F");
        }

        debug!(pid, ?signal, "Terminating process tree with taskkill");
        let output = Command::new("taskkill")
            .args(&args)
            .output()
            .map_err(|e| ProcwrapError::CancellationFailed {
                pid,
                message: format!("Failed to run taskkill: {}", e),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" errors are OK - process already dead
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(())
        } else {
            Err(ProcwrapError::CancellationFailed {
                pid,
                message: stderr.trim().to_string(),
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = signal;
        Err(ProcwrapError::CancellationFailed {
            pid,
            message: "Process termination not implemented for this platform".to_string(),
        })
    }
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_signal_missing_group_is_ok() {
        // No group with this id can exist: pids are capped well below it.
        assert!(signal_process_tree(i32::MAX as u32, TerminationSignal::Forced).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_kills_group_leader() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        place_in_new_group(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sleep");

        signal_process_tree(child.id(), TerminationSignal::Forced).expect("signal group");

        let status = child.wait().expect("wait for sleep");
        assert!(!status.success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_termination_observed_without_reaping() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        place_in_new_group(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sh");
        let pid = child.id();

        assert!(wait_for_termination(&mut child).expect("wait without reaping"));
        assert!(has_terminated(pid));
        // Still a zombie: the group leader can be signalled and then reaped.
        assert!(signal_process_tree(pid, TerminationSignal::Forced).is_ok());
        assert_eq!(child.wait().expect("reap sh").code(), Some(3));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_running_child_has_not_terminated() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        place_in_new_group(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sleep");

        assert!(!has_terminated(child.id()));

        signal_process_tree(child.id(), TerminationSignal::Forced).expect("signal group");
        child.wait().expect("reap sleep");
    }
}
