use std::path::PathBuf;

use thiserror::Error;

use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {message}")]
    Database { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("catalog `{path}` could not be loaded: {message}")]
    Catalog { path: PathBuf, message: String },
    #[error("catalog `{path}` is invalid: {source}")]
    InvalidCatalog {
        path: PathBuf,
        #[source]
        source: DomainError,
    },
}

impl InfraError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn catalog(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Catalog {
            path: path.into(),
            message: message.into(),
        }
    }
}
