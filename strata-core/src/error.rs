//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The builder's process exit code is derived from the error kind:
//! a failed `RUN` child propagates its exact exit status, everything else
//! exits 1.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // User input errors
    #[error("invalid flag combination: {reason}")]
    InvalidOptions { reason: String },

    #[error("build context error: {reason}")]
    Context { reason: String },

    // Dockerfile errors
    #[error("invalid Dockerfile at {path:?}: {source}")]
    InvalidDockerfile {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("{target} is not a valid target build stage")]
    UnknownTarget { target: String },

    #[error("resolving build arg {name}: {reason}")]
    ArgResolution { name: String, reason: String },

    // Registry errors
    #[error("failed to pull {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("failed to push {image}: {reason}")]
    ImagePush { image: String, reason: String },

    #[error("invalid image reference {image}: {reason}")]
    InvalidImageRef { image: String, reason: String },

    // Step execution errors
    #[error("command exited with status {code}: {command}")]
    ChildExit { code: i32, command: String },

    #[error("starting command {command}: {source}")]
    ChildSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resolving user {user}: {reason}")]
    UserLookup { user: String, reason: String },

    #[error("{instruction} failed: {reason}")]
    Instruction { instruction: String, reason: String },

    #[error("checksum mismatch for {source_url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        source_url: String,
        expected: String,
        actual: String,
    },

    // Cache errors
    #[error("cache entry {key} is corrupt: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("secret {id} could not be resolved: {reason}")]
    Secret { id: String, reason: String },

    // Filesystem invariant violations. These indicate programming errors
    // and abort the build immediately.
    #[error("filesystem invariant violated: {reason}")]
    FilesystemInvariant { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// The process exit code this error maps to.
    ///
    /// A failing `RUN` propagates the child's exact exit status so that
    /// `RUN exit 42` produces a builder exit of 42. All other failures
    /// exit 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ChildExit { code, .. } => *code,
            _ => 1,
        }
    }
}

/// Dockerfile parse error with source location.
#[derive(Error, Debug, Clone)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_exit_code_propagates() {
        let err = StrataError::ChildExit { code: 42, command: "exit 42".into() };
        assert_eq!(err.exit_code(), 42);
    }

    #[test]
    fn test_other_errors_exit_one() {
        let err = StrataError::Internal("boom".into());
        assert_eq!(err.exit_code(), 1);

        let err = StrataError::UnknownTarget { target: "prod".into() };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new(7, "unknown instruction: FROMM");
        assert_eq!(err.to_string(), "line 7: unknown instruction: FROMM");
    }
}
