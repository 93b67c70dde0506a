// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for subprocess control, message decoding and synchronous runs.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while spawning, supervising or talking to a subprocess.
///
/// Every variant is cheap to clone so that one accumulated error can be handed
/// to every caller of [`Subprocess::close`](crate::Subprocess::close).
#[derive(Debug, Clone, Error)]
pub enum SubflowError {
    /// The process terminated with a non-zero exit status.
    #[error("exit code({0})")]
    ExitCode(i32),

    /// The process could not be spawned.
    #[error("failed to start process: {0}")]
    Start(#[source] Arc<io::Error>),

    /// The command description cannot be turned into a process.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// An I/O operation on the process failed (closing stdin, waiting).
    #[error("{context}: {source}")]
    Io {
        /// What was being done when the failure happened.
        context: &'static str,
        /// Underlying I/O failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// The process ended without a retrievable exit code.
    #[error("process terminated abnormally (code={code}, signal={signal:?})")]
    AbnormalTermination {
        /// Sentinel code reported in the `Exit` message.
        code: i32,
        /// Terminating signal, when the platform reports one.
        signal: Option<i32>,
    },

    /// A decoded message carried the wrong discriminant.
    #[error("format error: expected {expected:?}, got {found:?}")]
    Format {
        /// Tag the caller asked for.
        expected: String,
        /// Tag found on the wire.
        found: String,
    },

    /// JSON deserialization failure.
    #[error("deserialization error: {0}")]
    Decode(String),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Encode(String),

    /// A failure annotated with the stderr captured from the process.
    #[error("stderr({stderr:?}), {source}")]
    WithStderr {
        /// Captured standard error, lossily decoded.
        stderr: String,
        /// The failure being annotated.
        #[source]
        source: Box<SubflowError>,
    },

    /// Several failures accumulated over a process lifetime.
    #[error("{}", render_joined(.0))]
    Joined(Vec<SubflowError>),
}

fn render_joined(errors: &[SubflowError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl SubflowError {
    /// Wrap an I/O failure with a short description of the failed operation.
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io {
            context,
            source: Arc::new(source),
        }
    }

    /// Combine errors into one.
    ///
    /// Returns `None` for an empty input and the error itself when there is
    /// exactly one. Nested [`SubflowError::Joined`] values are flattened.
    pub fn join<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = SubflowError>,
    {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Self::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Joined(flat)),
        }
    }

    /// Iterate over the leaf errors, looking through `Joined` and `WithStderr`.
    pub fn leaves(&self) -> Vec<&SubflowError> {
        match self {
            Self::Joined(inner) => inner.iter().flat_map(|e| e.leaves()).collect(),
            Self::WithStderr { source, .. } => source.leaves(),
            other => vec![other],
        }
    }

    /// The exit code carried by this error, if any leaf is an [`SubflowError::ExitCode`].
    pub fn exit_code(&self) -> Option<i32> {
        self.leaves().into_iter().find_map(|e| match e {
            Self::ExitCode(code) => Some(*code),
            _ => None,
        })
    }

    /// Returns `true` when a leaf reports abnormal termination.
    pub fn is_abnormal(&self) -> bool {
        self.leaves()
            .into_iter()
            .any(|e| matches!(e, Self::AbnormalTermination { .. }))
    }
}
