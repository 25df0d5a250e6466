//! Managed child process with completion, capture and cancellation.

use super::exit::{exit_code_of, ExitSignal};
use super::output::{drain_stream, CaptureOptions, OutputSource, OutputStreams};
use super::spec::ProcessSpec;
use crate::cancel::{CancellationRegistration, CancellationToken};
use crate::config::ThreadNames;
use crate::error::{ProcwrapError, Result};
use crate::platform::{self, TerminationSignal};
use std::fmt;
use std::future::Future;
use std::io;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Constructed, not yet started.
    Created,
    /// Started and not yet seen to terminate.
    Running,
    /// Terminated, as observed by the exit watcher.
    Exited,
    /// Disposed. Terminal.
    Disposed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// State guarded by the handle's lock.
#[derive(Default)]
struct Lifecycle {
    pid: Option<u32>,
    exited: bool,
    disposed: bool,
    external_token: Option<CancellationToken>,
    internal_registration: Option<CancellationRegistration>,
    external_registration: Option<CancellationRegistration>,
}

struct Shared {
    spec: ProcessSpec,
    lifecycle: Mutex<Lifecycle>,
    cancel_requested: AtomicBool,
    exit: ExitSignal,
    token: CancellationToken,
}

/// A single child process with unified completion, output capture and
/// cooperative cancellation.
///
/// The handle owns the OS process exclusively. Cancellation from the handle,
/// from its [`cancellation_token`](Self::cancellation_token), or from a
/// registered external token all converge on one idempotent path that
/// terminates the whole process tree. Dropping the handle disposes it.
///
/// # Example
///
/// ```rust,no_run
/// use procwrap_core::{CaptureOptions, ManagedProcessHandle, ProcessSpec};
///
/// # async fn run() -> procwrap_core::Result<()> {
/// let handle = ManagedProcessHandle::new(ProcessSpec::new("cargo").arg("check"));
/// let streams = handle.start(CaptureOptions::all())?;
///
/// let output = streams.collect().await;
/// let code = handle.completion().await?;
/// println!("exit {code}: {}", output.stderr);
/// # Ok(())
/// # }
/// ```
pub struct ManagedProcessHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ManagedProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcessHandle")
            .field("program", &self.shared.spec.program)
            .field("pid", &self.process_id())
            .field("state", &self.state())
            .field("cancel_requested", &self.cancel_requested())
            .finish()
    }
}

impl ManagedProcessHandle {
    /// Create an unstarted handle for `spec`.
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec,
                lifecycle: Mutex::new(Lifecycle::default()),
                cancel_requested: AtomicBool::new(false),
                exit: ExitSignal::new(),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Create a handle and start it in one step.
    pub fn launch(spec: ProcessSpec, capture: CaptureOptions) -> Result<(Self, OutputStreams)> {
        let handle = Self::new(spec);
        let streams = handle.start(capture)?;
        Ok((handle, streams))
    }

    /// Launch the process without waiting for it.
    ///
    /// Streams selected in `capture` are drained on background threads and
    /// delivered through the returned [`OutputStreams`]; the rest are
    /// discarded. The internal token and any registered external token are
    /// armed once the process is running.
    pub fn start(&self, capture: CaptureOptions) -> Result<OutputStreams> {
        let shared = &self.shared;
        let (streams, pid) = {
            let mut life = shared.lock();
            if life.disposed {
                return Err(ProcwrapError::Disposed);
            }
            if life.pid.is_some() {
                return Err(ProcwrapError::AlreadyStarted);
            }
            shared
                .spec
                .validate()
                .map_err(|e| ProcwrapError::LaunchFailed {
                    program: shared.spec.program.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
                })?;

            // The watcher exists before the child does, so a child is never
            // left without someone to reap it. It blocks on our lock before
            // marking the exit and cannot observe the handle half-started.
            let (hand_off, pending) = std_mpsc::channel::<Child>();
            let watcher = Arc::clone(shared);
            spawn_named(ThreadNames::EXIT_WATCHER, move || {
                if let Ok(child) = pending.recv() {
                    watcher.watch_exit(child);
                }
            })?;

            let mut cmd = shared.spec.to_command(capture.stdout, capture.stderr);
            platform::place_in_new_group(&mut cmd);
            let mut child = cmd.spawn().map_err(|source| ProcwrapError::LaunchFailed {
                program: shared.spec.program.clone(),
                source,
            })?;
            let pid = child.id();

            let streams = match spawn_drains(&mut child, pid) {
                Ok(streams) => streams,
                Err(e) => {
                    abandon(child, pid);
                    return Err(e.into());
                }
            };
            if let Err(std_mpsc::SendError(child)) = hand_off.send(child) {
                abandon(child, pid);
                return Err(ProcwrapError::Other("exit watcher stopped".to_string()));
            }

            life.pid = Some(pid);
            (streams, pid)
        };

        info!(
            pid,
            program = %shared.spec.program.display(),
            "Started process"
        );
        self.arm_cancellation();
        Ok(streams)
    }

    /// Block until the process exits or `timeout` elapses.
    ///
    /// Returns `true` if the process exited. `None` waits forever.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        self.check_waitable()?;
        Ok(self.shared.exit.wait(timeout).is_some())
    }

    /// Like [`wait_for_exit`](Self::wait_for_exit), but returns the exit code.
    pub fn wait_for_exit_code(&self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let pid = self.check_waitable()?;
        match self.shared.exit.wait(timeout) {
            None => Ok(None),
            Some(Ok(code)) => Ok(Some(code)),
            Some(Err(message)) => Err(ProcwrapError::Finalization { pid, message }),
        }
    }

    /// Future resolving to the exit code once the process has been reaped.
    ///
    /// The future is independent of the handle's borrow and may be awaited
    /// on any executor. It never resolves if the process never starts or
    /// never exits; apply a timeout or cancel the handle for that.
    pub fn completion(&self) -> impl Future<Output = Result<i32>> + Send + 'static {
        let mut receiver = self.shared.exit.subscribe();
        let shared = Arc::clone(&self.shared);
        async move {
            let outcome = receiver
                .wait_for(Option::is_some)
                .await
                .map(|value| (*value).clone());
            match outcome {
                Ok(Some(Ok(code))) => Ok(code),
                Ok(Some(Err(message))) => Err(ProcwrapError::Finalization {
                    pid: shared.lock().pid.unwrap_or_default(),
                    message,
                }),
                Ok(None) | Err(_) => Err(ProcwrapError::Other(
                    "exit signal closed before the process exited".to_string(),
                )),
            }
        }
    }

    /// Let `token` cancel the process as well.
    ///
    /// Only one external token is tracked; registering another replaces it.
    /// A token registered before [`start`](Self::start) is armed at start. An
    /// already-cancelled token cancels the process as soon as it is armed.
    pub fn register_external_cancellation(&self, token: &CancellationToken) -> Result<()> {
        let (running, previous) = {
            let mut life = self.shared.lock();
            if life.disposed {
                return Err(ProcwrapError::Disposed);
            }
            life.external_token = Some(token.clone());
            (
                life.pid.is_some() && !life.exited,
                life.external_registration.take(),
            )
        };
        drop(previous);

        if running {
            let registration = token.register(cancel_on_signal(Arc::downgrade(&self.shared)));
            let rejected = {
                let mut life = self.shared.lock();
                if life.exited || life.disposed {
                    Some(registration)
                } else {
                    life.external_registration = Some(registration);
                    None
                }
            };
            drop(rejected);
        }
        Ok(())
    }

    /// The handle's own cancellation token. Cancelling it cancels the process.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Request termination of the process tree.
    ///
    /// Idempotent and best-effort: does nothing before start, after exit, or
    /// once a cancel was already requested, and does not wait for the process
    /// to die. Termination failures are logged, never returned. Fails only if
    /// the handle is disposed.
    pub fn cancel(&self) -> Result<()> {
        let life = self.shared.lock();
        if life.disposed {
            return Err(ProcwrapError::Disposed);
        }
        self.shared.cancel_locked(&life);
        Ok(())
    }

    /// Cancel the process and make the handle permanently inert.
    ///
    /// Safe to call repeatedly; calls after the first do nothing.
    pub fn dispose(&self) {
        let registrations = {
            let mut life = self.shared.lock();
            if life.disposed {
                return;
            }
            self.shared.cancel_locked(&life);
            life.disposed = true;
            life.external_token = None;
            (
                life.internal_registration.take(),
                life.external_registration.take(),
            )
        };
        drop(registrations);
        debug!(pid = ?self.process_id(), "Disposed process handle");
    }

    pub fn process_id(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.shared.exit.get().is_some()
    }

    /// Exit code, once the process has been reaped successfully.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit.get().and_then(|result| result.ok())
    }

    pub fn state(&self) -> ProcessState {
        let life = self.shared.lock();
        if life.disposed {
            ProcessState::Disposed
        } else if life.exited {
            ProcessState::Exited
        } else if life.pid.is_some() {
            ProcessState::Running
        } else {
            ProcessState::Created
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.shared.spec
    }

    fn check_waitable(&self) -> Result<u32> {
        let life = self.shared.lock();
        if life.disposed {
            return Err(ProcwrapError::Disposed);
        }
        life.pid.ok_or(ProcwrapError::NotStarted)
    }

    /// Register cancellation callbacks on the internal and external tokens.
    ///
    /// Registration happens outside the lock because an already-cancelled
    /// token runs the callback inline, and the callback takes the lock.
    fn arm_cancellation(&self) {
        let weak = Arc::downgrade(&self.shared);
        let internal = self.shared.token.register(cancel_on_signal(weak.clone()));
        let external_token = self.shared.lock().external_token.clone();
        let external = external_token.map(|token| token.register(cancel_on_signal(weak)));

        let rejected = {
            let mut life = self.shared.lock();
            if life.exited || life.disposed {
                Some((internal, external))
            } else {
                life.internal_registration = Some(internal);
                if external.is_some() {
                    life.external_registration = external;
                }
                None
            }
        };
        drop(rejected);
    }
}

impl Drop for ManagedProcessHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The single cancel path. Must be called with the lifecycle lock held,
    /// which serializes it against disposal and exit bookkeeping.
    fn cancel_locked(self: &Arc<Self>, life: &Lifecycle) {
        let Some(pid) = life.pid else {
            return;
        };
        // The watcher marks the exit before reaping, so while we hold the lock
        // an unmarked child is still unreaped and its pid cannot be recycled.
        if life.exited || platform::has_terminated(pid) {
            return;
        }
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = self.spec.kill_grace;
        info!(pid, ?grace, "Cancelling process tree");

        if grace.is_zero() {
            self.signal(pid, TerminationSignal::Forced);
            return;
        }

        self.signal(pid, TerminationSignal::Polite);
        let shared = Arc::clone(self);
        if let Err(e) = spawn_named(ThreadNames::KILL_ESCALATION, move || {
            shared.escalate(pid, grace)
        }) {
            warn!(pid, error = %e, "Failed to start kill escalation, killing now");
            self.signal(pid, TerminationSignal::Forced);
        }
    }

    fn escalate(&self, pid: u32, grace: Duration) {
        if self.exit.wait(Some(grace)).is_some() {
            return;
        }
        let life = self.lock();
        if life.exited {
            return;
        }
        debug!(pid, ?grace, "Grace period elapsed, forcing termination");
        self.signal(pid, TerminationSignal::Forced);
    }

    fn signal(&self, pid: u32, signal: TerminationSignal) {
        if let Err(e) = platform::signal_process_tree(pid, signal) {
            warn!(pid, ?signal, error = %e, "Failed to terminate process tree");
        }
    }

    /// Exit notification: runs on the watcher thread that owns the child.
    fn watch_exit(&self, mut child: Child) {
        let pid = child.id();
        match platform::wait_for_termination(&mut child) {
            Ok(true) => self.mark_exited(),
            Ok(false) => {}
            Err(e) => debug!(pid, error = %e, "Falling back to a reaping wait"),
        }

        let result = child
            .wait()
            .map(exit_code_of)
            .map_err(|e| e.to_string());
        self.mark_exited();

        match &result {
            Ok(code) => info!(pid, code, "Process exited"),
            Err(message) => {
                let err = ProcwrapError::Finalization {
                    pid,
                    message: message.clone(),
                };
                warn!(pid, "{}", err);
            }
        }
        self.exit.resolve(result);
    }

    /// Flag the exit and drop the external subscription. Idempotent.
    fn mark_exited(&self) {
        let external = {
            let mut life = self.lock();
            life.exited = true;
            life.external_token = None;
            life.external_registration.take()
        };
        drop(external);
    }
}

fn cancel_on_signal(shared: Weak<Shared>) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(shared) = shared.upgrade() {
            let life = shared.lock();
            if !life.disposed {
                debug!(pid = ?life.pid, "Cancellation token fired");
                shared.cancel_locked(&life);
            }
        }
    }
}

fn spawn_named<F>(name: &str, f: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
}

fn spawn_drains(child: &mut Child, pid: u32) -> std::io::Result<OutputStreams> {
    let mut streams = OutputStreams::default();

    if let Some(stdout) = child.stdout.take() {
        let (sender, receiver) = mpsc::unbounded_channel();
        spawn_named(ThreadNames::STDOUT_DRAIN, move || {
            drain_stream(stdout, OutputSource::Stdout, pid, sender)
        })?;
        streams.stdout = Some(receiver);
    }

    if let Some(stderr) = child.stderr.take() {
        let (sender, receiver) = mpsc::unbounded_channel();
        spawn_named(ThreadNames::STDERR_DRAIN, move || {
            drain_stream(stderr, OutputSource::Stderr, pid, sender)
        })?;
        streams.stderr = Some(receiver);
    }

    Ok(streams)
}

/// Kill and reap a child whose handle could not be set up.
fn abandon(mut child: Child, pid: u32) {
    if let Err(e) = platform::signal_process_tree(pid, TerminationSignal::Forced) {
        warn!(pid, error = %e, "Failed to kill abandoned process");
    }
    if let Err(e) = child.wait() {
        warn!(pid, error = %e, "Failed to reap abandoned process");
    }
}
