// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subcommand implementations for the `subflow` CLI.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use subflow::{
    CancellationToken, CommandSpec, Input, JsonlCodec, MessageKind, SubflowConfig, Subprocess,
};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::format::{Formatter, OutputFormat};

/// What to run: program, arguments and extra `KEY=VALUE` environment entries.
#[derive(Debug, Clone)]
pub struct Target {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment entries.
    pub env: Vec<String>,
}

impl Target {
    fn spec(&self) -> CommandSpec {
        CommandSpec::with_args_env(&self.program, &self.args, &self.env)
    }
}

/// Options of the `stream` subcommand.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Inputs queued before the process starts.
    pub inputs: Vec<String>,
    /// Forward the CLI's own stdin, line by line.
    pub forward_stdin: bool,
    /// Close timeout; the configured one when `None`.
    pub timeout: Option<Duration>,
    /// Rendering of each message.
    pub format: OutputFormat,
}

/// Map a process exit code onto a CLI exit status.
pub fn exit_status(code: i32) -> u8 {
    match code {
        0 => 0,
        c if c < 0 => 1,
        c => u8::try_from(c).unwrap_or(1),
    }
}

/// Stream every message of `target` into `out`. Returns the exit code carried
/// by the final `exit` message.
pub async fn stream<W: AsyncWrite + Unpin>(
    target: &Target,
    opts: &StreamOptions,
    config: &SubflowConfig,
    mut out: W,
) -> Result<i32> {
    let scope = CancellationToken::new();
    let proc = Subprocess::with_options(&scope, &target.spec(), &config.process_options())
        .with_context(|| format!("prepare '{}'", target.program))?;
    let mut messages = proc.listen(&scope);
    let timeout = opts.timeout.unwrap_or_else(|| config.close_timeout());

    proc.push(opts.inputs.iter().map(|s| Input::line(s)));
    if opts.forward_stdin {
        tokio::spawn(forward_stdin(proc.clone()));
    } else {
        proc.finish_input();
    }

    let interrupted = proc.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!(target: "subflow", "interrupted; closing");
            let _ = interrupted.close_timeout(timeout).await;
        }
    });

    proc.start();

    let formatter = Formatter::new(opts.format);
    let mut code = subflow::ABNORMAL_EXIT_CODE;
    while let Some(msg) = messages.next().await {
        if let Some(c) = msg.exit_code() {
            code = c;
        }
        out.write_all(formatter.format_message(&msg)?.as_bytes())
            .await
            .context("write message")?;
        out.flush().await.context("flush output")?;
    }

    if let Err(e) = proc.close_timeout(timeout).await {
        debug!(target: "subflow", error = %e, "process finished with error");
    }
    Ok(code)
}

async fn forward_stdin(proc: Subprocess) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => proc.push([Input::line(line)]),
            Ok(None) => break,
            Err(e) => {
                warn!(target: "subflow", error = %e, "reading stdin failed");
                break;
            }
        }
    }
    proc.finish_input();
}

/// Run `target` to completion, copying its output through. Returns its exit
/// code.
pub async fn run<O: Write, E: Write>(
    target: &Target,
    stdin_file: Option<&PathBuf>,
    config: &SubflowConfig,
    mut out: O,
    mut err: E,
) -> Result<i32> {
    let input = match stdin_file {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("read stdin file '{}'", path.display()))?,
        None => Vec::new(),
    };

    let scope = CancellationToken::new();
    let interrupt = scope.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let output =
        subflow::run_with_options(&scope, &target.spec(), input, &config.process_options()).await;
    watcher.abort();

    out.write_all(output.stdout()).context("write stdout")?;
    out.flush().context("flush stdout")?;
    err.write_all(output.stderr()).context("write stderr")?;
    if let Some(e) = output.err() {
        writeln!(err, "subflow: {e}").context("write error")?;
    }
    Ok(output.code())
}

/// Decode JSONL messages from `reader`, rendering each into `out`.
///
/// With `kind`, every message must carry that kind; the first one that does
/// not fails the whole decode. Returns the number of messages decoded.
pub fn decode<R: BufRead, W: Write>(
    reader: R,
    kind: Option<MessageKind>,
    format: OutputFormat,
    mut out: W,
) -> Result<usize> {
    let formatter = Formatter::new(format);
    let mut count = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let msg = match kind {
            Some(kind) => JsonlCodec::decode_as(kind, &line),
            None => JsonlCodec::decode(&line),
        }
        .with_context(|| format!("line {}", idx + 1))?;
        out.write_all(formatter.format_message(&msg)?.as_bytes())
            .context("write message")?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use subflow::Message;

    fn lines(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| JsonlCodec::encode(m).unwrap())
            .collect()
    }

    #[test]
    fn exit_status_mapping() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }

    #[test]
    fn decode_counts_and_skips_blank_lines() {
        let input = format!(
            "{}\n{}",
            lines(&[Message::start(), Message::stdout("x")]),
            lines(&[Message::exit(0)])
        );
        let mut out = Vec::new();
        let n = decode(Cursor::new(input), None, OutputFormat::Jsonl, &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 3);
    }

    #[test]
    fn decode_with_kind_reports_first_mismatch() {
        let input = lines(&[Message::stdout("a"), Message::stderr("b"), Message::stdout("c")]);
        let err = decode(
            Cursor::new(input),
            Some(MessageKind::Stdout),
            OutputFormat::Jsonl,
            Vec::<u8>::new(),
        )
        .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.starts_with("line 2"), "{rendered}");
        assert!(rendered.contains("format error"), "{rendered}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_echo_emits_start_stdout_exit() {
        let target = Target {
            program: "echo".into(),
            args: vec!["hi".into()],
            env: vec![],
        };
        let mut out = Vec::new();
        let code = stream(
            &target,
            &StreamOptions::default(),
            &SubflowConfig::default(),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let decoded: Vec<Message> = JsonlCodec::decode_stream(Cursor::new(out))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded.first().map(Message::kind), Some(MessageKind::Start));
        assert_eq!(decoded.last().and_then(Message::exit_code), Some(0));
        let stdout: Vec<u8> = decoded
            .iter()
            .filter(|m| m.kind() == MessageKind::Stdout)
            .flat_map(|m| m.data().unwrap_or_default().to_vec())
            .collect();
        assert_eq!(stdout, b"hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_writes_through_async_pipe() {
        use tokio::io::AsyncReadExt;

        let target = Target {
            program: "echo".into(),
            args: vec!["piped".into()],
            env: vec![],
        };
        let (writer, mut reader) = tokio::io::duplex(64);
        let reading = tokio::spawn(async move {
            let mut text = String::new();
            reader.read_to_string(&mut text).await.unwrap();
            text
        });

        let opts = StreamOptions {
            format: OutputFormat::Text,
            ..StreamOptions::default()
        };
        let code = stream(&target, &opts, &SubflowConfig::default(), writer)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let text = reading.await.unwrap();
        assert!(text.contains("[stdout] \"piped\\n\""), "{text}");
        assert!(text.contains("[exit] code=0"), "{text}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_copies_output_and_reports_code() {
        let target = Target {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err >&2; exit 2".into()],
            env: vec![],
        };
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = run(&target, None, &SubflowConfig::default(), &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(code, 2);
        assert_eq!(out, b"out\n");
        let err = String::from_utf8(err).unwrap();
        assert!(err.starts_with("err\n"), "{err}");
        assert!(err.contains("exit code(2)"), "{err}");
    }
}
