// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle controller for a single streamed subprocess.
//!
//! A [`Subprocess`] owns one child process. Everything the child does is
//! published on one broadcast channel as [`Message`]s: a `Start` marker, the
//! chunks it writes to stdout and stderr, echoes of what was written to its
//! stdin, and a final `Exit` marker after which the channel is closed.
//!
//! ```text
//!   Created ──start()──▶ Started ──(child reaped)──▶ Done
//!      │                                              ▲
//!      └───────────────close() before start()─────────┘
//! ```
//!
//! `start` takes effect at most once. Shutdown may be requested any number of
//! times, from any number of tasks; the child is signalled once, killed at
//! most once, and every caller observes the same outcome.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Broadcast, Subscription};
use crate::command::{Command, CommandParts, ProcessOptions};
use crate::message::{Input, Message, StdioStream};
use crate::signal;
use crate::stdio::{self, StdioWriter};
use crate::SubflowError;

/// Exit code reported when the process has no exit code of its own.
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// How long a cancelled process may ignore the stop request before it is
/// killed, unless a close timeout was given.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a [`Subprocess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed; nothing spawned yet.
    Created,
    /// `start` was called; the child is being spawned or is running.
    Started,
    /// Terminal. The outcome is available.
    Done,
}

impl ControllerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Started => 1,
            Self::Done => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Started,
            _ => Self::Done,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Done => "done",
        })
    }
}

struct Inner {
    /// Rendered command line, for log fields.
    display: String,
    command: Mutex<Option<tokio::process::Command>>,
    /// Shared by every activity of this controller.
    cancel: CancellationToken,
    /// Disarms the parent-scope watcher.
    watcher: CancellationToken,
    bus: Broadcast<Message>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<Input>>>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<Input>>>,
    state: AtomicU8,
    kill_armed: AtomicBool,
    kill: Notify,
    /// 0 until spawned.
    pid: AtomicU32,
    outcome: OnceLock<Option<SubflowError>>,
    done: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a streamed subprocess.
///
/// Cloning yields another handle to the same process. The controller is
/// driven by tasks on the current Tokio runtime, so it must be created from
/// within one.
#[derive(Clone)]
pub struct Subprocess {
    inner: Arc<Inner>,
}

impl fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subprocess")
            .field("command", &self.inner.display)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Subprocess {
    /// Prepare `cmd` to run under `parent`, inheriting the caller's environment.
    ///
    /// Nothing is spawned until [`start`](Self::start). If `parent` is
    /// cancelled before [`close`](Self::close) is called, the controller shuts
    /// itself down.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new<C>(parent: &CancellationToken, cmd: &C) -> Result<Self, SubflowError>
    where
        C: Command + ?Sized,
    {
        Self::with_options(parent, cmd, &ProcessOptions::default())
    }

    /// Like [`new`](Self::new), with explicit [`ProcessOptions`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_options<C>(
        parent: &CancellationToken,
        cmd: &C,
        options: &ProcessOptions,
    ) -> Result<Self, SubflowError>
    where
        C: Command + ?Sized,
    {
        // Cancels the derived scope if any step below fails.
        let guard = parent.child_token().drop_guard();

        let parts = CommandParts::collect(cmd);
        let command = parts.to_tokio(options)?;
        let display = render(&parts);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            display,
            command: Mutex::new(Some(command)),
            cancel: guard.disarm(),
            watcher: CancellationToken::new(),
            bus: Broadcast::new(),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx: Mutex::new(Some(input_rx)),
            state: AtomicU8::new(ControllerState::Created.as_u8()),
            kill_armed: AtomicBool::new(false),
            kill: Notify::new(),
            pid: AtomicU32::new(0),
            outcome: OnceLock::new(),
            done,
        });
        arm_watcher(parent.clone(), &inner);

        debug!(target: "subflow", command = %inner.display, "subprocess prepared");
        Ok(Self { inner })
    }

    /// Spawn the process. Only the first call has an effect; calls after
    /// [`close`](Self::close) do nothing.
    pub fn start(&self) {
        if !self
            .inner
            .transition(ControllerState::Created, ControllerState::Started)
        {
            debug!(target: "subflow", state = %self.state(), "start ignored");
            return;
        }
        self.inner.bus.push([Message::start()]);
        tokio::spawn(Arc::clone(&self.inner).supervise());
    }

    /// Queue inputs for the process's stdin, delivered in order.
    ///
    /// Inputs may be queued before [`start`](Self::start). Inputs pushed after
    /// [`finish_input`](Self::finish_input) or after the process ended are
    /// dropped.
    pub fn push<I>(&self, inputs: I)
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        // Collected first: the iterator may call back into this handle.
        let inputs: Vec<Input> = inputs.into_iter().map(Into::into).collect();
        let guard = lock(&self.inner.input_tx);
        let Some(tx) = guard.as_ref() else {
            debug!(target: "subflow", "input finished; dropping pushed inputs");
            return;
        };
        for input in inputs {
            if tx.send(input).is_err() {
                debug!(target: "subflow", "stdin no longer accepts input; dropping pushed inputs");
                return;
            }
        }
    }

    /// Stop accepting inputs. Queued inputs are still delivered, then stdin
    /// is closed.
    pub fn finish_input(&self) {
        if lock(&self.inner.input_tx).take().is_some() {
            debug!(target: "subflow", "input finished");
        }
    }

    /// Subscribe to messages published from now on.
    ///
    /// The subscription ends after the `Exit` message, or when `scope` is
    /// cancelled.
    #[must_use]
    pub fn listen(&self, scope: &CancellationToken) -> Subscription<Message> {
        self.inner.bus.listen(scope)
    }

    /// Shut down and wait for the process to end.
    ///
    /// A process that ignores the stop request is killed after
    /// [`STOP_GRACE`].
    pub async fn close(&self) -> Result<(), SubflowError> {
        self.close_timeout(Duration::ZERO).await
    }

    /// Shut down, killing the process if it has not ended `timeout` after
    /// the stop request. A zero `timeout` falls back to [`STOP_GRACE`].
    ///
    /// Returns the accumulated process error. Every caller, concurrent or
    /// later, receives the same result.
    pub async fn close_timeout(&self, timeout: Duration) -> Result<(), SubflowError> {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.watcher.cancel();

        if inner.transition(ControllerState::Created, ControllerState::Done) {
            debug!(target: "subflow", command = %inner.display, "closed before start");
            inner.release_unstarted();
        } else if !timeout.is_zero() && !inner.kill_armed.swap(true, Ordering::AcqRel) {
            tokio::select! {
                _ = self.done() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!(target: "subflow", timeout_ms = timeout.as_millis() as u64, "close timeout elapsed");
                    inner.kill.notify_one();
                }
            }
        }

        self.done().await;
        inner.result()
    }

    /// Wait until the controller is done, without requesting shutdown.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether the controller reached [`ControllerState::Done`].
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

fn render(parts: &CommandParts) -> String {
    std::iter::once(parts.command.as_str())
        .chain(parts.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Close the controller when `parent` is cancelled, unless disarmed first.
fn arm_watcher(parent: CancellationToken, inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    let disarmed = inner.watcher.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = disarmed.cancelled() => {}
            _ = parent.cancelled() => {
                if let Some(inner) = weak.upgrade() {
                    debug!(target: "subflow", command = %inner.display, "parent scope cancelled");
                    let _ = Subprocess { inner }.close().await;
                }
            }
        }
    });
}

impl Inner {
    fn transition(&self, from: ControllerState, to: ControllerState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn result(&self) -> Result<(), SubflowError> {
        match self.outcome.get() {
            Some(Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn release_unstarted(&self) {
        lock(&self.command).take();
        lock(&self.input_tx).take();
        lock(&self.input_rx).take();
        let _ = self.outcome.set(None);
        self.bus.close([]);
        self.done.send_replace(true);
    }

    async fn supervise(self: Arc<Self>) {
        let (code, errors) = self.run_child().await;
        let _ = self.outcome.set(SubflowError::join(errors));
        self.bus.close([Message::exit(code)]);
        lock(&self.input_tx).take();
        self.state
            .store(ControllerState::Done.as_u8(), Ordering::Release);
        self.done.send_replace(true);
    }

    async fn run_child(&self) -> (i32, Vec<SubflowError>) {
        let abnormal = || {
            (
                ABNORMAL_EXIT_CODE,
                vec![SubflowError::ExitCode(ABNORMAL_EXIT_CODE)],
            )
        };

        let Some(mut command) = lock(&self.command).take() else {
            return abnormal();
        };
        if self.cancel.is_cancelled() {
            debug!(target: "subflow", command = %self.display, "cancelled before spawn");
            return abnormal();
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(target: "subflow", command = %self.display, error = %e, "failed to spawn process");
                let (code, mut errors) = abnormal();
                errors.insert(0, SubflowError::Start(Arc::new(e)));
                return (code, errors);
            }
        };
        drop(command);

        let pid = child.id();
        if let Some(pid) = pid {
            self.pid.store(pid, Ordering::Release);
        }
        info!(target: "subflow", pid = ?pid, command = %self.display, "process spawned");

        let io_stop = CancellationToken::new();
        let mut forwarders: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            let writer = StdioWriter::new(StdioStream::Stdout, self.bus.clone());
            forwarders.push(tokio::spawn(stdio::forward(out, writer, io_stop.clone())));
        }
        if let Some(err) = child.stderr.take() {
            let writer = StdioWriter::new(StdioStream::Stderr, self.bus.clone());
            forwarders.push(tokio::spawn(stdio::forward(err, writer, io_stop.clone())));
        }

        let pump_stop = self.cancel.child_token();
        let queue = lock(&self.input_rx).take();
        let pump = match (child.stdin.take(), queue) {
            (Some(stdin), Some(queue)) => {
                let echo = StdioWriter::new(StdioStream::Stdin, self.bus.clone());
                Some(tokio::spawn(stdio::pump_input(
                    queue,
                    stdin,
                    echo,
                    pump_stop.clone(),
                )))
            }
            _ => None,
        };

        let status = self.wait_child(&mut child).await;

        // Drain output to EOF; stop early only once shutdown was requested.
        let drain = futures::future::join_all(forwarders);
        tokio::pin!(drain);
        tokio::select! {
            biased;
            _ = &mut drain => {}
            _ = self.cancel.cancelled() => {
                io_stop.cancel();
                drain.await;
            }
        }

        pump_stop.cancel();
        let stdin_closed = match pump {
            Some(handle) => handle.await.unwrap_or(Ok(())),
            None => Ok(()),
        };

        let mut errors = Vec::new();
        let code = match status {
            Ok(status) => exit_code_of(&status, &mut errors),
            Err(e) => {
                errors.push(SubflowError::io("wait for process", e));
                errors.push(SubflowError::ExitCode(ABNORMAL_EXIT_CODE));
                ABNORMAL_EXIT_CODE
            }
        };
        if let Err(e) = stdin_closed {
            errors.push(SubflowError::io("close stdin", e));
        }

        info!(target: "subflow", pid = ?pid, code, "process exited");
        (code, errors)
    }

    async fn wait_child(&self, child: &mut Child) -> io::Result<ExitStatus> {
        let grace = tokio::time::sleep(STOP_GRACE);
        tokio::pin!(grace);
        let mut stop_requested = false;
        let mut grace_spent = false;
        loop {
            tokio::select! {
                status = child.wait() => return status,
                _ = self.cancel.cancelled(), if !stop_requested => {
                    stop_requested = true;
                    signal::request_stop(child);
                    grace.as_mut().reset(tokio::time::Instant::now() + STOP_GRACE);
                }
                _ = &mut grace, if stop_requested && !grace_spent => {
                    grace_spent = true;
                    // An explicit close timeout owns the kill.
                    if !self.kill_armed.load(Ordering::Acquire) {
                        warn!(target: "subflow", pid = ?child.id(), "process ignored stop request; killing");
                        signal::force_kill(child);
                    }
                }
                _ = self.kill.notified() => {
                    warn!(target: "subflow", pid = ?child.id(), "process did not stop in time; killing");
                    signal::force_kill(child);
                }
            }
        }
    }
}

pub(crate) fn exit_code_of(status: &ExitStatus, errors: &mut Vec<SubflowError>) -> i32 {
    match status.code() {
        Some(0) => 0,
        Some(code) => {
            errors.push(SubflowError::ExitCode(code));
            code
        }
        None => {
            errors.push(SubflowError::AbnormalTermination {
                code: ABNORMAL_EXIT_CODE,
                signal: signal::terminating_signal(status),
            });
            errors.push(SubflowError::ExitCode(ABNORMAL_EXIT_CODE));
            ABNORMAL_EXIT_CODE
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandSpec;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ControllerState::Created,
            ControllerState::Started,
            ControllerState::Done,
        ] {
            assert_eq!(ControllerState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn empty_executable_cancels_derived_scope() {
        let parent = CancellationToken::new();
        let err = Subprocess::new(&parent, &CommandSpec::new("")).unwrap_err();
        assert!(matches!(err, SubflowError::InvalidCommand(_)));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn close_before_start_is_clean() {
        let proc = Subprocess::new(&CancellationToken::new(), &CommandSpec::new("true")).unwrap();
        let mut sub = proc.listen(&CancellationToken::new());
        proc.close().await.unwrap();
        assert_eq!(proc.state(), ControllerState::Done);
        assert!(proc.is_done());
        assert!(proc.pid().is_none());
        assert!(sub.recv().await.is_none());

        proc.start();
        assert_eq!(proc.state(), ControllerState::Done);
    }

    #[tokio::test]
    async fn spawn_failure_still_publishes_exit() {
        let proc = Subprocess::new(
            &CancellationToken::new(),
            &CommandSpec::new("/nonexistent/subflow-test-binary"),
        )
        .unwrap();
        let mut sub = proc.listen(&CancellationToken::new());
        proc.start();

        let mut last = None;
        while let Some(msg) = sub.recv().await {
            last = Some(msg);
        }
        assert_eq!(last.and_then(|m| m.exit_code()), Some(ABNORMAL_EXIT_CODE));

        let err = proc.close().await.unwrap_err();
        assert!(matches!(err.leaves()[0], SubflowError::Start(_)));
        assert_eq!(err.exit_code(), Some(ABNORMAL_EXIT_CODE));
    }

    #[tokio::test]
    async fn parent_cancel_before_start_closes() {
        let parent = CancellationToken::new();
        let proc = Subprocess::new(&parent, &CommandSpec::new("true")).unwrap();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), proc.done())
            .await
            .unwrap();
        assert_eq!(proc.state(), ControllerState::Done);
        assert!(proc.close().await.is_ok());
    }

    #[test]
    fn nonzero_exit_maps_to_exit_code_error() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let mut errors = Vec::new();
            let code = exit_code_of(&ExitStatus::from_raw(3 << 8), &mut errors);
            assert_eq!(code, 3);
            assert!(matches!(errors[..], [SubflowError::ExitCode(3)]));

            let mut errors = Vec::new();
            let code = exit_code_of(&ExitStatus::from_raw(9), &mut errors);
            assert_eq!(code, ABNORMAL_EXIT_CODE);
            assert!(matches!(
                errors[..],
                [
                    SubflowError::AbnormalTermination { signal: Some(9), .. },
                    SubflowError::ExitCode(-1)
                ]
            ));
        }
    }
}
