// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Structured subprocess orchestration on Tokio.
//!
//! A [`Subprocess`] launches an external program and publishes everything it
//! does (start, stdout/stderr chunks, stdin echoes, exit) as one ordered
//! stream of [`Message`]s. [`run`] covers the simpler case of running a
//! command to completion and collecting its output.

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod run;
mod signal;
pub mod stdio;

pub use bus::{Broadcast, BroadcastStats, Subscription};
pub use codec::JsonlCodec;
pub use command::{Command, CommandParts, CommandSpec, ProcessOptions, with_env_appended};
pub use config::{ConfigError, ConfigWarning, SubflowConfig, load_config, validate_config};
pub use controller::{ABNORMAL_EXIT_CODE, ControllerState, STOP_GRACE, Subprocess};
pub use error::SubflowError;
pub use message::{Input, Message, MessageKind, StdioStream};
pub use run::{Output, run, run_with_options};
pub use stdio::{CHUNK_SIZE, StdioWriter};
pub use tokio_util::sync::CancellationToken;

/// Build an [`Input`] from format arguments, like `format!`.
///
/// ```
/// let input = subflow::input!("{} {}\n", "hello", 42);
/// assert_eq!(input.as_bytes(), b"hello 42\n");
/// ```
#[macro_export]
macro_rules! input {
    ($($arg:tt)*) => {
        $crate::Input::formatted(::std::format_args!($($arg)*))
    };
}
