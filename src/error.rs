use std::fmt;
use thiserror::Error;

use crate::source::SourceError;

/// A single field that failed validation before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Learner source error: {0}")]
    Source(#[from] SourceError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Validation failed: {}", join_fields(.fields))]
    Validation { fields: Vec<FieldError> },

    #[error("Invalid course key: {0}")]
    InvalidCourseKey(String),

    #[error("Invalid date: {0}")]
    DateParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Names of the fields that failed validation, empty for other variants.
    pub fn invalid_fields(&self) -> Vec<&'static str> {
        match self {
            Error::Validation { fields } => fields.iter().map(|f| f.field).collect(),
            _ => Vec::new(),
        }
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
