use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading or appending the sample log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sample log '{}' not found", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected at least 4 columns, found {found}")]
    InsufficientColumns { line: usize, found: usize },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// A speed test that did not produce a recorded sample.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("speed test request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("measurement service error: {0}")]
    Service(String),

    #[error("failed to record sample: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot write '{}': {reason}", .path.display())]
    Write { path: PathBuf, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("not enough data to plot: {0}")]
    InsufficientData(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("invalid chart style: {0}")]
    Style(String),

    #[error("plotting backend error: {0}")]
    Backend(String),

    #[error("cannot write chart '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StoreError> for RenderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientColumns { .. } => RenderError::InsufficientData(err.to_string()),
            other => RenderError::Store(other),
        }
    }
}
