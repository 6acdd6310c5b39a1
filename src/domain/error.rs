//! Error taxonomy for the registry, the scrape-config store and the reload call.
//!
//! Probe failures are not errors: they are recorded as `HealthResult` data and
//! drive the node lifecycle instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Rejected at the boundary, never persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("target {target} is already registered (node {existing_id})")]
    DuplicateTarget { target: String, existing_id: String },

    #[error("node {0} not found")]
    NotFound(String),

    /// Failure of the node database. Fatal to the calling mutation only.
    #[error("persistence failure: {context}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RegistryError {
    pub(crate) fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Errors from reading or writing the scrape-configuration document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scrape config {} does not exist", .0.display())]
    NotFound(PathBuf),

    /// The file is not a document we can safely edit; it must be left untouched.
    #[error("failed to parse scrape config {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors from the monitoring system's reload endpoint. Always non-fatal.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("reload endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("reload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
