// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run a command to completion and collect everything it printed.

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::{Command, CommandParts, ProcessOptions};
use crate::controller::{ABNORMAL_EXIT_CODE, exit_code_of};
use crate::SubflowError;

/// Result of a synchronous run.
#[derive(Debug, Clone)]
pub struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i32,
    error: Option<SubflowError>,
}

impl Output {
    fn new(stdout: Vec<u8>, stderr: Vec<u8>, code: i32, mut errors: Vec<SubflowError>) -> Self {
        if code != 0 && !errors.iter().any(|e| e.exit_code().is_some()) {
            errors.push(SubflowError::ExitCode(code));
        }
        let error = SubflowError::join(errors).map(|source| SubflowError::WithStderr {
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            source: Box::new(source),
        });
        Self {
            stdout,
            stderr,
            code,
            error,
        }
    }

    /// Everything the process wrote to stdout.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Everything the process wrote to stderr.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Exit code; `-1` when the process could not be started, was cancelled,
    /// or ended without a code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The failure, annotated with the captured stderr.
    pub fn err(&self) -> Option<&SubflowError> {
        self.error.as_ref()
    }

    /// `true` when the process exited with code 0.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn the snapshot into a `Result`, keeping the output on success.
    pub fn into_result(self) -> Result<Self, SubflowError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Run `cmd` with `stdin` as its entire standard input, inheriting the
/// caller's environment.
///
/// Cancelling `scope` kills the process.
pub async fn run<C>(scope: &CancellationToken, cmd: &C, stdin: impl Into<Vec<u8>>) -> Output
where
    C: Command + ?Sized,
{
    run_with_options(scope, cmd, stdin, &ProcessOptions::default()).await
}

/// Like [`run`], with explicit [`ProcessOptions`].
pub async fn run_with_options<C>(
    scope: &CancellationToken,
    cmd: &C,
    stdin: impl Into<Vec<u8>>,
    options: &ProcessOptions,
) -> Output
where
    C: Command + ?Sized,
{
    let parts = CommandParts::collect(cmd);
    let mut command = match parts.to_tokio(options) {
        Ok(command) => command,
        Err(e) => return Output::new(Vec::new(), Vec::new(), ABNORMAL_EXIT_CODE, vec![e]),
    };
    if scope.is_cancelled() {
        debug!(target: "subflow", command = %parts.command, "run cancelled before spawn");
        return Output::new(Vec::new(), Vec::new(), ABNORMAL_EXIT_CODE, Vec::new());
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = SubflowError::Start(std::sync::Arc::new(e));
            return Output::new(Vec::new(), Vec::new(), ABNORMAL_EXIT_CODE, vec![err]);
        }
    };
    info!(target: "subflow", pid = ?child.id(), command = %parts.command, "run spawned");

    let input: Vec<u8> = stdin.into();
    let feeder = child.stdin.take().map(|mut pipe| {
        tokio::spawn(async move {
            // A child that exits without reading leaves us with a broken pipe.
            if let Err(e) = pipe.write_all(&input).await {
                debug!(target: "subflow.stdio", error = %e, "stdin feed stopped");
            }
        })
    });

    // Dropping the wait future drops the child, which kills it.
    let waited = tokio::select! {
        out = child.wait_with_output() => Some(out),
        _ = scope.cancelled() => None,
    };
    if let Some(feeder) = feeder {
        feeder.abort();
    }

    let mut errors = Vec::new();
    match waited {
        Some(Ok(out)) => {
            let code = exit_code_of(&out.status, &mut errors);
            info!(target: "subflow", code, "run finished");
            Output::new(out.stdout, out.stderr, code, errors)
        }
        Some(Err(e)) => {
            errors.push(SubflowError::io("wait for process", e));
            Output::new(Vec::new(), Vec::new(), ABNORMAL_EXIT_CODE, errors)
        }
        None => {
            debug!(target: "subflow", command = %parts.command, "run cancelled");
            Output::new(Vec::new(), Vec::new(), ABNORMAL_EXIT_CODE, errors)
        }
    }
}
