//! Error taxonomy shared across the engine.
//!
//! Five classes with distinct handling policies:
//! - `Validation` / `Configuration`: unrecoverable, raised synchronously at
//!   construction or plan-build time.
//! - `Network` / `Storage`: transient, retried by the retry engine and only
//!   surfaced to workers after exhaustion.
//! - `Fatal`: logged, the affected work item is skipped, the run continues.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T, E = FetchError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Bad input to a constructor or builder.
    #[error("validation error in {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Missing or inconsistent component wiring at plan build time.
    #[error("configuration error in {component}: {message}")]
    Configuration {
        component: &'static str,
        message: String,
    },

    /// Transient network or remote-resource failure.
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Key-value or object-store failure.
    #[error("storage error in {component}: {message}")]
    Storage {
        component: &'static str,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Unrecoverable failure surfaced from retry exhaustion.
    #[error("fatal error: {message}")]
    Fatal { message: String },
}

impl FetchError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn configuration(component: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            component,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_from(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn storage(component: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            component,
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_from(
        component: &'static str,
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Storage {
            component,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the scheduler should treat this as unrecoverable for the
    /// current work item (as opposed to a transient failure).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Fatal { .. })
    }

    /// Whether this is a transient failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Storage { .. })
    }
}
