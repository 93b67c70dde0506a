// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command descriptions: what to run, with which arguments and environment.
//!
//! A command exposes its executable through [`Command::command`] and may
//! additionally expose arguments and environment entries. The two optional
//! capabilities are independent: a command that only has arguments reports
//! no environment, and vice versa.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::warn;

use crate::SubflowError;

/// Something that can be turned into a process.
pub trait Command: Send + Sync {
    /// Executable to run, resolved through `PATH` when not a path.
    fn command(&self) -> &str;

    /// Arguments, when this command exposes the arguments capability.
    fn args(&self) -> Option<&[String]> {
        None
    }

    /// `KEY=VALUE` environment entries, when this command exposes the
    /// environment capability.
    fn environment(&self) -> Option<&[String]> {
        None
    }
}

/// Immutable, general-purpose [`Command`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    command: String,
    args: Option<Vec<String>>,
    env: Option<Vec<String>>,
}

impl CommandSpec {
    /// A command with neither arguments nor environment.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: None,
            env: None,
        }
    }

    /// A command with arguments.
    pub fn with_args<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: Some(args.into_iter().map(Into::into).collect()),
            env: None,
        }
    }

    /// A command with `KEY=VALUE` environment entries.
    pub fn with_env<I, S>(command: impl Into<String>, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: None,
            env: Some(env.into_iter().map(Into::into).collect()),
        }
    }

    /// A command with both arguments and environment entries.
    pub fn with_args_env<A, E, S, T>(command: impl Into<String>, args: A, env: E) -> Self
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
        E: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            command: command.into(),
            args: Some(args.into_iter().map(Into::into).collect()),
            env: Some(env.into_iter().map(Into::into).collect()),
        }
    }
}

impl Command for CommandSpec {
    fn command(&self) -> &str {
        &self.command
    }

    fn args(&self) -> Option<&[String]> {
        self.args.as_deref()
    }

    fn environment(&self) -> Option<&[String]> {
        self.env.as_deref()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for arg in self.args.iter().flatten() {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Derive a new command with `additions` appended to the environment of `cmd`.
///
/// The executable and arguments are copied; `cmd` itself is left untouched.
/// The result always exposes the environment capability.
pub fn with_env_appended<C, I, S>(cmd: &C, additions: I) -> CommandSpec
where
    C: Command + ?Sized,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let parts = CommandParts::collect(cmd);
    let mut env = parts.env;
    env.extend(additions.into_iter().map(Into::into));
    CommandSpec {
        command: parts.command,
        args: cmd.args().map(<[String]>::to_vec),
        env: Some(env),
    }
}

/// Effective `(command, args, env)` triple of a [`Command`].
///
/// An absent capability collects as an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandParts {
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
}

impl CommandParts {
    /// Read every capability of `cmd` independently.
    pub fn collect<C: Command + ?Sized>(cmd: &C) -> Self {
        Self {
            command: cmd.command().to_string(),
            args: cmd.args().map(<[String]>::to_vec).unwrap_or_default(),
            env: cmd.environment().map(<[String]>::to_vec).unwrap_or_default(),
        }
    }

    /// Environment entries split into key/value pairs.
    ///
    /// Entries without `=` or with an empty key are skipped with a warning.
    pub fn env_pairs(&self) -> Vec<(&str, &str)> {
        self.env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Some((key, value)),
                _ => {
                    warn!(target: "subflow", entry = %entry, "ignoring malformed environment entry");
                    None
                }
            })
            .collect()
    }

    /// Build a `tokio` process description with all three stdio streams piped.
    ///
    /// The child is killed if its handle is dropped before it was reaped.
    pub fn to_tokio(&self, options: &ProcessOptions) -> Result<tokio::process::Command, SubflowError> {
        if self.command.trim().is_empty() {
            return Err(SubflowError::InvalidCommand(
                "executable must not be empty".into(),
            ));
        }

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !options.inherit_env {
            cmd.env_clear();
        }
        for (key, value) in self.env_pairs() {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        Ok(cmd)
    }
}

/// Per-spawn process options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Start from the caller's environment (`true`) or from an empty one.
    pub inherit_env: bool,
    /// Working directory of the child; the caller's when `None`.
    pub working_dir: Option<PathBuf>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            inherit_env: true,
            working_dir: None,
        }
    }
}
