use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Every variant is a fatal startup condition; nothing here is retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The tracking document could not be read from disk.
    #[error("failed to read config file `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The tracking document is not valid YAML for the expected shape.
    #[error("failed to parse config file `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A `$VAR` indirection referenced an unset environment variable.
    #[error("environment variable `{name}` referenced by configuration is not set")]
    MissingEnvVar { name: String },

    /// A track key did not match `<table>.<insert|update|delete>`.
    #[error("invalid track key `{key}`: expected `<table>.<insert|update|delete>`")]
    InvalidTrackKey { key: String },

    /// A tracking rule failed structural validation.
    #[error("invalid rule for `{key}`: {reason}")]
    InvalidRule { key: String, reason: String },

    /// A destination filter glob did not compile.
    #[error("invalid filter pattern `{pattern}`: {reason}")]
    InvalidFilter { pattern: String, reason: String },

    /// A destination entry is unknown or missing required fields.
    #[error("destination `{kind}`: {reason}")]
    Destination { kind: String, reason: String },

    /// An ignore entry is neither `"*"` nor a non-empty column list.
    #[error("invalid ignore entry for table `{table}`: {reason}")]
    InvalidIgnore { table: String, reason: String },

    /// A required process environment variable is absent.
    #[error("`{name}` is not set")]
    MissingRequiredEnv { name: String },

    /// A process environment variable holds an unparseable value.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidEnvValue { name: String, reason: String },
}
