// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz command construction and environment appending with structured input.
#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use subflow::{Command, CommandParts, CommandSpec, with_env_appended};

#[derive(Debug, Arbitrary)]
struct Input {
    command: String,
    args: Option<Vec<String>>,
    env: Option<Vec<String>>,
    additions: Vec<String>,
}

fuzz_target!(|input: Input| {
    let spec = match (input.args, input.env) {
        (None, None) => CommandSpec::new(input.command),
        (Some(a), None) => CommandSpec::with_args(input.command, a),
        (None, Some(e)) => CommandSpec::with_env(input.command, e),
        (Some(a), Some(e)) => CommandSpec::with_args_env(input.command, a, e),
    };

    let derived = with_env_appended(&spec, input.additions.clone());
    let before = spec.environment().map_or(0, <[String]>::len);
    assert_eq!(
        derived.environment().map_or(0, <[String]>::len),
        before + input.additions.len()
    );

    let parts = CommandParts::collect(&derived);
    // Malformed entries are skipped, never invented.
    assert!(parts.env_pairs().len() <= parts.env.len());
    let _ = spec.to_string();
});
