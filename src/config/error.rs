//! Configuration loading and validation errors.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::verification::RuleConfigError;

/// Errors raised while loading a [`super::CoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that was read.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for this schema.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong.
        reason: String,
    },

    /// The verification rules do not build.
    #[error(transparent)]
    Rules(#[from] RuleConfigError),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
