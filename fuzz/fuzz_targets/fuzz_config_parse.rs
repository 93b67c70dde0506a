// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz `SubflowConfig` TOML parsing and validation.
//!
//! Checks that parsing and validation never panic and that a parsed config
//! survives a TOML round-trip unchanged.
#![no_main]
use libfuzzer_sys::fuzz_target;
use subflow::config::parse_toml;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = parse_toml(s) else {
        return;
    };

    match subflow::validate_config(&config) {
        Ok(warnings) => {
            for w in &warnings {
                let _ = format!("{w}");
            }
        }
        Err(e) => {
            let _ = format!("{e}");
        }
    }

    if let Ok(toml_str) = toml::to_string(&config)
        && let Ok(rt) = parse_toml(&toml_str)
    {
        assert_eq!(config, rt, "TOML round-trip must be lossless");
    }

    let _ = config.process_options();
    let _ = config.close_timeout();
});
