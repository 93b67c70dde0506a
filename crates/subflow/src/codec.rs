// SPDX-License-Identifier: MIT OR Apache-2.0
//! Newline-delimited JSON encoding of [`Message`]s.

use std::io::BufRead;

use crate::{Message, MessageKind, SubflowError};

/// Stateless codec for messages as newline-delimited JSON.
#[derive(Debug, Clone, Copy)]
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize a message to a newline-terminated JSON line.
    pub fn encode(msg: &Message) -> Result<String, SubflowError> {
        let mut s = serde_json::to_string(msg).map_err(|e| SubflowError::Encode(e.to_string()))?;
        s.push('\n');
        Ok(s)
    }

    /// Deserialize one JSON line into whichever message it describes.
    pub fn decode(line: &str) -> Result<Message, SubflowError> {
        Message::decode(line.trim_end())
    }

    /// Deserialize one JSON line, requiring the discriminant of `expected`.
    pub fn decode_as(expected: MessageKind, line: &str) -> Result<Message, SubflowError> {
        Message::decode_as(expected, line.trim_end())
    }

    /// Decode every non-blank line of `reader`.
    pub fn decode_stream<R: BufRead>(
        reader: R,
    ) -> impl Iterator<Item = Result<Message, SubflowError>> {
        reader.lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(Self::decode(&line)),
            Err(e) => Some(Err(SubflowError::io("read jsonl line", e))),
        })
    }
}
