//! Error types for artifact output.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures while writing a part artifact.
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    /// Creating, writing, syncing or renaming the artifact failed.
    #[error("could not write {path}: {message}\n  Suggestion: check free space and permissions on the output directory")]
    Write {
        /// Final artifact path.
        path: PathBuf,
        /// Underlying error.
        message: String,
    },
}

impl OutputError {
    #[must_use]
    pub fn write(path: &Path, error: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            message: error.to_string(),
        }
    }
}
