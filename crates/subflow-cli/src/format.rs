// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting for streamed messages.

use std::fmt;
use std::str::FromStr;
use subflow::{JsonlCodec, Message, SubflowError};

/// Supported renderings of a message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One JSON object per line, the wire format.
    #[default]
    Jsonl,
    /// Human-readable lines prefixed with the message kind.
    Text,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jsonl => "jsonl",
            Self::Text => "text",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" => Ok(Self::Jsonl),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Renders messages in one [`OutputFormat`].
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a formatter for `format`.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render `msg` as one newline-terminated line.
    pub fn format_message(&self, msg: &Message) -> Result<String, SubflowError> {
        match self.format {
            OutputFormat::Jsonl => JsonlCodec::encode(msg),
            OutputFormat::Text => Ok(text_line(msg)),
        }
    }
}

fn text_line(msg: &Message) -> String {
    let time = msg.time().format("%H:%M:%S%.3f");
    match (msg.exit_code(), msg.data()) {
        (Some(code), _) => format!("{time} [exit] code={code}\n"),
        (None, Some(data)) => {
            let text = String::from_utf8_lossy(data);
            format!("{time} [{}] {:?}\n", msg.kind(), text)
        }
        (None, None) => format!("{time} [{}]\n", msg.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_formats() {
        assert_eq!("JSONL".parse::<OutputFormat>(), Ok(OutputFormat::Jsonl));
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("yaml".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default().to_string(), "jsonl");
    }

    #[test]
    fn jsonl_is_wire_format() {
        let line = Formatter::new(OutputFormat::Jsonl)
            .format_message(&Message::exit(4))
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["kind"], "exit");
        assert_eq!(v["code"], 4);
    }

    #[test]
    fn text_names_kind_and_quotes_data() {
        let f = Formatter::new(OutputFormat::Text);
        let line = f.format_message(&Message::stderr("oops\n")).unwrap();
        assert!(line.ends_with("[stderr] \"oops\\n\"\n"), "{line}");
        let line = f.format_message(&Message::start()).unwrap();
        assert!(line.ends_with("[start]\n"), "{line}");
        let line = f.format_message(&Message::exit(-1)).unwrap();
        assert!(line.ends_with("[exit] code=-1\n"), "{line}");
    }
}
