// SPDX-License-Identifier: MIT OR Apache-2.0
//! Messages published by a [`Subprocess`](crate::Subprocess) and the inputs it consumes.
//!
//! On the wire every message is a flat JSON object with a `"time"` stamp and
//! a `"kind"` discriminant; stdio messages carry a second `"stdio"`
//! discriminant naming the stream:
//!
//! ```text
//! {"time":"2024-05-01T10:00:00Z","kind":"start"}
//! {"time":"2024-05-01T10:00:00Z","kind":"stdio","stdio":"stdout","data":"hello\n"}
//! {"time":"2024-05-01T10:00:01Z","kind":"exit","code":0}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::SubflowError;

const TAG_START: &str = "start";
const TAG_EXIT: &str = "exit";
const TAG_STDIO: &str = "stdio";

// ── StdioStream ─────────────────────────────────────────────────────

/// One of the three standard streams of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Standard input, as echoed after a write.
    Stdin,
}

impl StdioStream {
    /// Value of the `"stdio"` field on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Stdin => "stdin",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "stdin" => Some(Self::Stdin),
            _ => None,
        }
    }
}

impl fmt::Display for StdioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── MessageKind ─────────────────────────────────────────────────────

/// Discriminant of a [`Message`], fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// The process has been launched.
    Start,
    /// The process has terminated.
    Exit,
    /// A chunk read from standard output.
    Stdout,
    /// A chunk read from standard error.
    Stderr,
    /// Bytes written to standard input.
    StdinEcho,
}

impl MessageKind {
    /// All kinds, in stream order of first appearance.
    pub const ALL: [MessageKind; 5] = [
        Self::Start,
        Self::Stdout,
        Self::Stderr,
        Self::StdinEcho,
        Self::Exit,
    ];

    /// Value of the `"kind"` field on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Start => TAG_START,
            Self::Exit => TAG_EXIT,
            Self::Stdout | Self::Stderr | Self::StdinEcho => TAG_STDIO,
        }
    }

    /// The stream for stdio kinds, `None` for lifecycle kinds.
    pub const fn stdio(self) -> Option<StdioStream> {
        match self {
            Self::Stdout => Some(StdioStream::Stdout),
            Self::Stderr => Some(StdioStream::Stderr),
            Self::StdinEcho => Some(StdioStream::Stdin),
            Self::Start | Self::Exit => None,
        }
    }

    const fn from_stream(stream: StdioStream) -> Self {
        match stream {
            StdioStream::Stdout => Self::Stdout,
            StdioStream::Stderr => Self::Stderr,
            StdioStream::Stdin => Self::StdinEcho,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stdio() {
            Some(stream) => f.write_str(stream.tag()),
            None => f.write_str(self.tag()),
        }
    }
}

impl FromStr for MessageKind {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "exit" => Ok(Self::Exit),
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "stdin" | "stdin_echo" => Ok(Self::StdinEcho),
            other => Err(SubflowError::Format {
                expected: "start|exit|stdout|stderr|stdin".into(),
                found: other.into(),
            }),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// An event in the life of a subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The process has been launched. Always the first message of a stream.
    Start {
        /// Creation time.
        time: DateTime<Utc>,
    },
    /// The process terminated. Always the last message of a stream.
    Exit {
        /// Creation time.
        time: DateTime<Utc>,
        /// Exit code, `-1` when none could be obtained.
        code: i32,
    },
    /// Raw bytes moved over one of the standard streams.
    Stdio {
        /// Creation time.
        time: DateTime<Utc>,
        /// Which stream.
        stream: StdioStream,
        /// One read or write worth of bytes.
        data: Vec<u8>,
    },
}

impl Message {
    /// A `Start` message stamped now.
    pub fn start() -> Self {
        Self::Start { time: Utc::now() }
    }

    /// An `Exit` message stamped now.
    pub fn exit(code: i32) -> Self {
        Self::Exit {
            time: Utc::now(),
            code,
        }
    }

    /// A stdio message stamped now, owning a copy of `data`.
    pub fn stdio(stream: StdioStream, data: impl AsRef<[u8]>) -> Self {
        Self::Stdio {
            time: Utc::now(),
            stream,
            data: data.as_ref().to_vec(),
        }
    }

    /// A `Stdout` message stamped now.
    pub fn stdout(data: impl AsRef<[u8]>) -> Self {
        Self::stdio(StdioStream::Stdout, data)
    }

    /// A `Stderr` message stamped now.
    pub fn stderr(data: impl AsRef<[u8]>) -> Self {
        Self::stdio(StdioStream::Stderr, data)
    }

    /// A `StdinEcho` message stamped now.
    pub fn stdin(data: impl AsRef<[u8]>) -> Self {
        Self::stdio(StdioStream::Stdin, data)
    }

    /// Discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Start { .. } => MessageKind::Start,
            Self::Exit { .. } => MessageKind::Exit,
            Self::Stdio { stream, .. } => MessageKind::from_stream(*stream),
        }
    }

    /// Creation time.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Start { time } | Self::Exit { time, .. } | Self::Stdio { time, .. } => *time,
        }
    }

    /// Payload of a stdio message.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Stdio { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Exit code of an `Exit` message.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Decode `json` into whichever message it describes.
    ///
    /// Unknown discriminants fail with [`SubflowError::Format`].
    pub fn decode(json: &str) -> Result<Self, SubflowError> {
        let wire: WireMessage =
            serde_json::from_str(json).map_err(|e| SubflowError::Decode(e.to_string()))?;
        Self::from_wire(wire, None)
    }

    /// Decode `json`, requiring it to carry the discriminant of `expected`.
    pub fn decode_as(expected: MessageKind, json: &str) -> Result<Self, SubflowError> {
        let wire: WireMessage =
            serde_json::from_str(json).map_err(|e| SubflowError::Decode(e.to_string()))?;
        Self::from_wire(wire, Some(expected))
    }

    fn to_wire(&self) -> WireMessage {
        match self {
            Self::Start { time } => WireMessage {
                time: *time,
                kind: TAG_START.into(),
                stdio: None,
                data: None,
                code: None,
            },
            Self::Exit { time, code } => WireMessage {
                time: *time,
                kind: TAG_EXIT.into(),
                stdio: None,
                data: None,
                code: Some(*code),
            },
            Self::Stdio { time, stream, data } => WireMessage {
                time: *time,
                kind: TAG_STDIO.into(),
                stdio: Some(stream.tag().into()),
                data: Some(String::from_utf8_lossy(data).into_owned()),
                code: None,
            },
        }
    }

    fn from_wire(wire: WireMessage, expected: Option<MessageKind>) -> Result<Self, SubflowError> {
        let found = match (wire.kind.as_str(), wire.stdio.as_deref()) {
            (TAG_START, _) => MessageKind::Start,
            (TAG_EXIT, _) => MessageKind::Exit,
            (TAG_STDIO, Some(tag)) => match StdioStream::from_tag(tag) {
                Some(stream) => MessageKind::from_stream(stream),
                None => {
                    return Err(SubflowError::Format {
                        expected: expected.map_or_else(
                            || "stdout|stderr|stdin".to_string(),
                            |k| k.to_string(),
                        ),
                        found: tag.to_string(),
                    });
                }
            },
            (TAG_STDIO, None) => {
                return Err(SubflowError::Format {
                    expected: expected.map_or_else(|| "stdio".to_string(), |k| k.to_string()),
                    found: "stdio without stream".into(),
                });
            }
            (other, _) => {
                return Err(SubflowError::Format {
                    expected: expected
                        .map_or_else(|| "start|exit|stdio".to_string(), |k| k.tag().to_string()),
                    found: other.to_string(),
                });
            }
        };

        if let Some(expected) = expected
            && expected != found
        {
            return Err(SubflowError::Format {
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }

        let time = wire.time;
        Ok(match found {
            MessageKind::Start => Self::Start { time },
            MessageKind::Exit => Self::Exit {
                time,
                code: wire.code.unwrap_or_default(),
            },
            stdio => Self::Stdio {
                time,
                // Stdio kinds always map to a stream.
                stream: stdio.stdio().unwrap_or(StdioStream::Stdout),
                data: wire.data.map(String::into_bytes).unwrap_or_default(),
            },
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        Self::from_wire(wire, None).map_err(serde::de::Error::custom)
    }
}

/// Flat JSON shape shared by every message.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    time: DateTime<Utc>,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
}

// ── Input ───────────────────────────────────────────────────────────

/// Bytes queued for delivery to a process's standard input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Input {
    data: Vec<u8>,
}

impl Input {
    /// Input carrying exactly `data`.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self {
            data: data.as_ref().to_vec(),
        }
    }

    /// Input carrying `data` followed by a newline.
    pub fn line(data: impl AsRef<[u8]>) -> Self {
        let mut data = data.as_ref().to_vec();
        data.push(b'\n');
        Self { data }
    }

    /// Input from formatted text, e.g. `Input::formatted(format_args!("{n}\n"))`.
    pub fn formatted(args: fmt::Arguments<'_>) -> Self {
        Self {
            data: fmt::format(args).into_bytes(),
        }
    }

    /// The bytes to write.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the input, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of bytes to write.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self {
            data: value.into_bytes(),
        }
    }
}

impl From<&[u8]> for Input {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<Vec<u8>> for Input {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}
