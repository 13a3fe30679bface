use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ParserAttempt {
    pub parser: &'static str,
    pub message: String,
}

impl ParserAttempt {
    pub fn new(parser: &'static str, message: impl Into<String>) -> Self {
        Self {
            parser,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParserAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.parser, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("{parser} format mismatch: {reason}")]
    FormatMismatch {
        parser: &'static str,
        reason: String,
    },

    #[error("{parser} header row {row_index} invalid: {message}")]
    InvalidHeader {
        parser: &'static str,
        row_index: usize,
        message: String,
    },

    #[error("{parser} CSV error: {source}")]
    Csv {
        parser: &'static str,
        #[source]
        source: csv::Error,
    },

    #[error("{parser} table error: {source}")]
    Polars {
        parser: &'static str,
        #[source]
        source: polars::error::PolarsError,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{parser} data row {line_index} invalid: {message}")]
    DataRow {
        parser: &'static str,
        line_index: usize,
        message: String,
    },

    #[error("{parser} validation error: {message}")]
    Validation {
        parser: &'static str,
        message: String,
    },

    #[error("{parser} file did not contain any data rows")]
    EmptyData { parser: &'static str },

    #[error("no cycler format recognized {path}; attempts: {attempts:?}")]
    UnrecognizedFormat {
        path: PathBuf,
        attempts: Vec<ParserAttempt>,
    },
}

impl ParserError {
    pub(crate) fn polars(parser: &'static str) -> impl FnOnce(polars::error::PolarsError) -> Self {
        move |source| ParserError::Polars { parser, source }
    }

    pub(crate) fn csv(parser: &'static str) -> impl FnOnce(csv::Error) -> Self {
        move |source| ParserError::Csv { parser, source }
    }
}
