// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz single-line message decoding.
//!
//! Checks that:
//! 1. `JsonlCodec::decode` never panics.
//! 2. A decoded message re-encodes to one line that decodes to the same value.
//! 3. `decode_as` agrees with `decode` on the message kind.
#![no_main]
use libfuzzer_sys::fuzz_target;
use subflow::{JsonlCodec, MessageKind};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(msg) = JsonlCodec::decode(line) else {
        return;
    };

    let encoded = JsonlCodec::encode(&msg).expect("decoded message must encode");
    assert_eq!(encoded.matches('\n').count(), 1);
    let again = JsonlCodec::decode(&encoded).expect("re-encoded message must decode");
    assert_eq!(again, msg);

    for kind in MessageKind::ALL {
        assert_eq!(
            JsonlCodec::decode_as(kind, line).is_ok(),
            kind == msg.kind(),
            "decode_as({kind}) disagrees with decode"
        );
    }
});
