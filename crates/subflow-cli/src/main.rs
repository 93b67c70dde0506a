// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

mod commands;
mod format;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use subflow::{MessageKind, SubflowConfig, load_config, validate_config};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use commands::{StreamOptions, Target};
use format::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "subflow", version, about = "Stream subprocess activity as JSON lines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program, printing every message it produces.
    Stream {
        #[command(flatten)]
        target: TargetArgs,

        /// Line written to the program's stdin before anything else. Can be repeated.
        #[arg(long = "input")]
        inputs: Vec<String>,

        /// Forward this process's stdin to the program, line by line.
        #[arg(long)]
        stdin: bool,

        /// Kill the program this long after an interrupt if it has not exited.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output format: jsonl | text.
        #[arg(long, default_value = "jsonl")]
        format: OutputFormat,
    },

    /// Run a program to completion and pass its output through.
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// File whose contents become the program's stdin.
        #[arg(long)]
        stdin_file: Option<PathBuf>,
    },

    /// Read JSONL messages from stdin and check them.
    Decode {
        /// Require every message to be of this kind: start | exit | stdout | stderr | stdin.
        #[arg(long)]
        kind: Option<MessageKind>,

        /// Output format: jsonl | text.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Environment entry for the program as KEY=VALUE. Can be repeated.
    #[arg(long = "env")]
    env: Vec<String>,

    /// Program to run, followed by its arguments.
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    command: Vec<String>,
}

impl From<TargetArgs> for Target {
    fn from(args: TargetArgs) -> Self {
        let mut command = args.command.into_iter();
        Target {
            program: command.next().unwrap_or_default(),
            args: command.collect(),
            env: args.env,
        }
    }
}

fn init_logging(debug: bool, config: &SubflowConfig) {
    let filter = if debug {
        EnvFilter::new("subflow=debug,subflow.stdio=debug")
    } else {
        let level = config.log_level.as_deref().unwrap_or("info");
        EnvFilter::new(format!("subflow={level}"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("load configuration")?;
    init_logging(cli.debug, &config);
    for warning in validate_config(&config).context("validate configuration")? {
        warn!(target: "subflow", "{warning}");
    }

    let code = match cli.command {
        Commands::Stream {
            target,
            inputs,
            stdin,
            timeout_ms,
            format,
        } => {
            let opts = StreamOptions {
                inputs,
                forward_stdin: stdin,
                timeout: timeout_ms.map(Duration::from_millis),
                format,
            };
            commands::stream(&target.into(), &opts, &config, tokio::io::stdout()).await?
        }
        Commands::Run { target, stdin_file } => {
            commands::run(
                &target.into(),
                stdin_file.as_ref(),
                &config,
                io::stdout(),
                io::stderr(),
            )
            .await?
        }
        Commands::Decode { kind, format } => {
            commands::decode(BufReader::new(io::stdin().lock()), kind, format, io::stdout())?;
            0
        }
    };

    Ok(ExitCode::from(commands::exit_status(code)))
}
