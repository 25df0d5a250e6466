//! One-shot exit signal shared by blocking waiters and async awaiters.

use crate::config::ProcessConfig;
use std::process::ExitStatus;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Exit code, or the reason it could not be collected.
pub(crate) type ExitResult = std::result::Result<i32, String>;

/// Resolves exactly once with the outcome of the exit watcher.
#[derive(Debug)]
pub(crate) struct ExitSignal {
    state: Mutex<Option<ExitResult>>,
    resolved: Condvar,
    watch: watch::Sender<Option<ExitResult>>,
}

impl ExitSignal {
    pub(crate) fn new() -> Self {
        let (watch, _) = watch::channel(None);
        Self {
            state: Mutex::new(None),
            resolved: Condvar::new(),
            watch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ExitResult>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `result` unless already resolved. Returns whether it was stored.
    pub(crate) fn resolve(&self, result: ExitResult) -> bool {
        let mut state = self.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(result.clone());
        self.resolved.notify_all();
        drop(state);

        self.watch.send_replace(Some(result));
        true
    }

    pub(crate) fn get(&self) -> Option<ExitResult> {
        self.lock().clone()
    }

    /// Block until resolved or `timeout` elapses (`None` waits forever).
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<ExitResult> {
        let state = self.lock();
        let state = match timeout {
            None => self
                .resolved
                .wait_while(state, |s| s.is_none())
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.resolved
                    .wait_timeout_while(state, timeout, |s| s.is_none())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        state.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<ExitResult>> {
        self.watch.subscribe()
    }
}

/// Map an OS exit status to a single numeric code.
///
/// Normal exits report their own code. On Unix a process killed by signal `n`
/// reports `128 + n`, like a POSIX shell. Anything else is `-1`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessConfig::SIGNAL_EXIT_CODE_BASE + signal;
        }
    }

    ProcessConfig::UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_resolves_once() {
        let signal = ExitSignal::new();
        assert!(signal.resolve(Ok(3)));
        assert!(!signal.resolve(Ok(4)));
        assert_eq!(signal.get(), Some(Ok(3)));
    }

    #[test]
    fn test_wait_times_out() {
        let signal = ExitSignal::new();
        assert_eq!(signal.wait(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn test_wait_wakes_on_resolve() {
        let signal = Arc::new(ExitSignal::new());
        let resolver = signal.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok(0));
        });

        assert_eq!(signal.wait(None), Some(Ok(0)));
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_sees_resolution() {
        let signal = ExitSignal::new();
        let mut receiver = signal.subscribe();
        signal.resolve(Err("wait failed".to_string()));

        let value = (*receiver.wait_for(Option::is_some).await.unwrap()).clone();
        assert_eq!(value, Some(Err("wait failed".to_string())));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_mapping() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(ExitStatus::from_raw(2 << 8)), 2);
        // Raw wait status 9 means "terminated by SIGKILL".
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
    }
}
