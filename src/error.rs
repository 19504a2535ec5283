//! Error taxonomy for scanning, criteria evaluation and cache persistence.
//!
//! Entry-level failures (an unreadable file, an entry that does not parse)
//! are recorded on the search context and never abort a walk. The variants
//! here are what crosses an API boundary: root-level aborts, background task
//! failures, query-level criterion failures and snapshot errors.

use std::fmt;
use thiserror::Error;

/// Result type for scanner operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Error type returned by user supplied predicates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unreadable archive {path}: {source}")]
    Archive {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Cannot parse {key}: {message}")]
    Parse { key: String, message: String },
    #[error("Every predicate failed while testing {key}: {}", .failures.join("; "))]
    CriterionEvaluation { key: String, failures: Vec<String> },
    #[error("Background task failed: {0}")]
    Concurrency(String),
    #[error("Scan of {root} aborted: {source}")]
    RootAborted {
        root: String,
        #[source]
        source: Box<ScanError>,
    },
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ScanError>),
    #[error("Scanner or search context already closed")]
    Closed,
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] heed::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

fn join_errors(errors: &[ScanError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ScanError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn archive(path: impl Into<String>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }

    pub fn parse(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn root_aborted(root: impl Into<String>, source: ScanError) -> Self {
        Self::RootAborted {
            root: root.into(),
            source: Box::new(source),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// How a failure of this kind is recorded against a single entry.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Parse { .. } => FailureKind::Parse,
            Self::CriterionEvaluation { .. } => FailureKind::Criterion,
            _ => FailureKind::Io,
        }
    }

    /// Collapses a list of errors: `None` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise.
    pub fn aggregate(mut errors: Vec<ScanError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

/// Kind of a failure recorded against a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Io,
    Parse,
    Criterion,
}

/// A failure recorded against one entry; the walk carried on past it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EntryFailure {
    pub key: String,
    pub kind: FailureKind,
    pub message: String,
}

impl EntryFailure {
    pub fn new(key: impl Into<String>, kind: FailureKind, message: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            kind,
            message: message.to_string(),
        }
    }
}
