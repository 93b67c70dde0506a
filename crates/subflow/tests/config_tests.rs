// SPDX-License-Identifier: MIT OR Apache-2.0
//! File-based configuration loading and validation.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use subflow::config::parse_toml;
use subflow::{ConfigError, ConfigWarning, SubflowConfig, load_config, validate_config};

fn env_is_clean() -> bool {
    [
        "SUBFLOW_LOG_LEVEL",
        "SUBFLOW_WORKING_DIR",
        "SUBFLOW_CLOSE_TIMEOUT_MS",
        "SUBFLOW_INHERIT_ENV",
    ]
    .iter()
    .all(|k| std::env::var_os(k).is_none())
}

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn load_reads_every_field() {
    if !env_is_clean() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let file = write_config(&format!(
        "log_level = \"debug\"\ninherit_env = false\nworking_dir = {:?}\nclose_timeout_ms = 250\n",
        dir.path().display().to_string()
    ));

    let cfg = load_config(Some(file.path())).unwrap();
    assert_eq!(cfg.log_level.as_deref(), Some("debug"));
    assert!(!cfg.inherit_env);
    assert_eq!(cfg.working_dir.as_deref(), Some(dir.path()));
    assert_eq!(cfg.close_timeout(), Duration::from_millis(250));

    let opts = cfg.process_options();
    assert!(!opts.inherit_env);
    assert_eq!(opts.working_dir.as_deref(), Some(dir.path()));

    assert_eq!(
        validate_config(&cfg).unwrap(),
        vec![ConfigWarning::EmptyEnvironment]
    );
}

#[test]
fn load_without_path_is_default() {
    if !env_is_clean() {
        return;
    }
    assert_eq!(load_config(None).unwrap(), SubflowConfig::default());
}

#[test]
fn empty_file_keeps_defaults() {
    if !env_is_clean() {
        return;
    }
    let file = write_config("");
    let cfg = load_config(Some(file.path())).unwrap();
    assert!(cfg.inherit_env);
    assert_eq!(cfg.close_timeout(), Duration::ZERO);
}

#[test]
fn missing_file_is_reported_with_path() {
    let err = load_config(Some(&PathBuf::from("/no/such/subflow.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound { .. }));
    assert!(err.to_string().contains("/no/such/subflow.toml"));
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config("log_level = \"info\"\nretries = 3\n");
    let err = load_config(Some(file.path())).unwrap_err();
    match err {
        ConfigError::ParseError { reason } => assert!(reason.contains("retries"), "{reason}"),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let file = write_config("log_level = \n");
    assert!(matches!(
        load_config(Some(file.path())),
        Err(ConfigError::ParseError { .. })
    ));
}

#[test]
fn validation_collects_every_problem() {
    let cfg = parse_toml("log_level = \"loud\"\nclose_timeout_ms = 0\nworking_dir = \"\"\n").unwrap();
    match validate_config(&cfg).unwrap_err() {
        ConfigError::ValidationError { reasons } => {
            assert_eq!(reasons.len(), 3, "{reasons:?}");
            assert!(reasons[0].contains("loud"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn large_timeout_and_missing_dir_warn() {
    let cfg =
        parse_toml("close_timeout_ms = 120000\nworking_dir = \"/no/such/dir/for/subflow\"\n")
            .unwrap();
    let warnings = validate_config(&cfg).unwrap();
    assert_eq!(
        warnings,
        vec![
            ConfigWarning::LargeTimeout { millis: 120_000 },
            ConfigWarning::MissingWorkingDir {
                path: PathBuf::from("/no/such/dir/for/subflow"),
            },
        ]
    );
    assert!(warnings.iter().all(|w| !w.to_string().is_empty()));
}
