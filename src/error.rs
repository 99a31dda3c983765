use std::path::PathBuf;
use thiserror::Error;

/// Configuration failures. Fatal at initial load; at reload the previous
/// table stays in effect and the error is only reported.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("program `{program}`: invalid {field}: {reason}")]
    Invalid {
        program: String,
        field: &'static str,
        reason: String,
    },
}

/// Command-level failures, reported as reply text; the session continues.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no such program in config: `{0}`")]
    UnknownProgram(String),

    #[error("program `{name}` has no instance {index}")]
    NoSuchInstance { name: String, index: usize },

    #[error("cannot attach to `{name}`: {reason}")]
    NotAttachable { name: String, reason: String },
}

/// Unparseable control line. The reply is a usage message; the session
/// continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}
