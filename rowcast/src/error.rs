use std::borrow::Cow;
use std::{error, fmt, result};

/// Result alias used throughout the delivery engine.
pub type RowcastResult<T> = result::Result<T, RowcastError>;

/// Classification of agent errors.
///
/// The taxonomy mirrors how the engine reacts: configuration and compilation
/// kinds are fatal at startup, query/transaction kinds roll the current batch
/// back, and evaluation/destination kinds are per-entry and feed the retry
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Configuration is structurally invalid or references missing resources.
    ConfigError,
    /// Schema introspection against the source database failed.
    SchemaError,
    /// An expression failed to compile or type-check.
    ExpressionCompileError,
    /// An expression failed while being evaluated against a row.
    EvaluationError,
    /// A log entry violates the old/new presence rule for its kind.
    MalformedLogEntry,
    /// A query against the event log failed.
    QueryError,
    /// The claiming transaction could not be finalized.
    TransactionError,
    /// A sink rejected a whole batch.
    DestinationError,
    /// Encoding an event or entry for a sink failed.
    SerializationError,
}

struct Inner {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Stable error type for the rowcast crates.
///
/// Carries a kind for classification, a static description, and optional
/// dynamic detail plus source error. Boxed so the success path stays one
/// pointer wide.
pub struct RowcastError(Box<Inner>);

impl RowcastError {
    pub fn with_source<E>(kind: ErrorKind, description: &'static str, source: E) -> RowcastError
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        RowcastError(Box::new(Inner {
            kind,
            description: Cow::Borrowed(description),
            detail: None,
            source: Some(source.into()),
        }))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the detail string, if one was attached.
    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }
}

impl From<(ErrorKind, &'static str)> for RowcastError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        RowcastError(Box::new(Inner {
            kind,
            description: Cow::Borrowed(description),
            detail: None,
            source: None,
        }))
    }
}

impl From<(ErrorKind, &'static str, String)> for RowcastError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        RowcastError(Box::new(Inner {
            kind,
            description: Cow::Borrowed(description),
            detail: Some(detail),
            source: None,
        }))
    }
}

impl fmt::Debug for RowcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowcastError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for RowcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.detail {
            Some(detail) => write!(f, "{}: {}", self.0.description, detail),
            None => write!(f, "{}", self.0.description),
        }
    }
}

impl error::Error for RowcastError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<sqlx::Error> for RowcastError {
    fn from(err: sqlx::Error) -> Self {
        RowcastError::with_source(ErrorKind::QueryError, "event log query failed", err)
    }
}

impl From<serde_json::Error> for RowcastError {
    fn from(err: serde_json::Error) -> Self {
        RowcastError::with_source(
            ErrorKind::SerializationError,
            "json serialization failed",
            err,
        )
    }
}
