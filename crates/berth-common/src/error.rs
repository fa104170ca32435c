//! Unified error type for the Berth workspace.
//!
//! Validation errors (`Parse`, `InvalidDockerfile`, `NoTags`) are raised before
//! any side effect. `Stream` errors normally travel inline as events and only
//! become a `BerthError` when a caller asks a drained session for its result.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a registry fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// The registry could not be reached.
    Network,
    /// The registry rejected the presented credentials.
    Unauthorized,
    /// The repository or manifest does not exist.
    NotFound,
    /// The registry answered with an unexpected status or payload.
    Registry,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network failure"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not found"),
            Self::Registry => write!(f, "registry error"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An image reference string is syntactically invalid.
    #[error("invalid image reference {reference:?}: {message}")]
    Parse {
        /// The rejected reference string.
        reference: String,
        /// What was wrong with it.
        message: String,
    },

    /// Fetching image metadata from a registry failed.
    #[error("fetching {reference}: {kind}: {message}")]
    Fetch {
        /// Reference being fetched.
        reference: String,
        /// Failure category.
        kind: FetchFailure,
        /// Registry or transport detail.
        message: String,
    },

    /// Registry credentials could not be resolved.
    #[error("credentials for registry {registry}: {message}")]
    Credential {
        /// Registry host the lookup was for.
        registry: String,
        /// Description of the failure.
        message: String,
    },

    /// A Dockerfile has no base-image directive.
    #[error("invalid Dockerfile {}: no FROM instruction", path.display())]
    InvalidDockerfile {
        /// Path of the rejected Dockerfile.
        path: PathBuf,
    },

    /// A push was requested without any tag.
    #[error("no tags provided, hence could not push image")]
    NoTags,

    /// The daemon reported errors inside a message stream.
    #[error("stream failed: {message}")]
    Stream {
        /// Collected error messages.
        message: String,
    },

    /// A command executed in a container exited non-zero.
    #[error("command `{command}` in container {container} exited with code {exit_code}")]
    Command {
        /// Command text as submitted.
        command: String,
        /// Container the command ran in.
        container: String,
        /// Exit code reported by the runtime.
        exit_code: i64,
    },

    /// A container runtime call failed.
    #[error("runtime {operation} failed for {target}: {message}")]
    Runtime {
        /// Name of the failing runtime operation.
        operation: &'static str,
        /// Container, image, or path the call targeted.
        target: String,
        /// Runtime error detail.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or API usage is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Builds a [`BerthError::Runtime`] from any displayable error.
    pub fn runtime(
        operation: &'static str,
        target: impl Into<String>,
        err: impl fmt::Display,
    ) -> Self {
        Self::Runtime {
            operation,
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Builds a [`BerthError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
