use std::path::PathBuf;
use thiserror::Error;

/// Failure of a pipeline stage or of the artifact store.
///
/// Every variant names the stage (or artifact path) it came from and the
/// offending identifier, so a failed run can be diagnosed from the message alone.
#[derive(Debug, Error)]
pub enum ScqcError {
    /// A required file or directory does not exist
    #[error("{stage}: missing input {}", path.display())]
    MissingInput {
        /// stage that needed the input
        stage: &'static str,
        /// path that was looked up
        path: PathBuf,
    },

    /// An input file exists but could not be parsed
    #[error("{stage}: malformed input {}: {reason}", path.display())]
    MalformedInput {
        /// stage that read the file
        stage: &'static str,
        /// offending file
        path: PathBuf,
        /// parser message
        reason: String,
    },

    /// Matrices and metadata disagree in row/column count or gene ordering
    #[error("{stage}: shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// stage that detected the mismatch
        stage: &'static str,
        /// the table, matrix or file that disagrees
        what: String,
        /// expected extent or identifier
        expected: String,
        /// extent or identifier actually found
        found: String,
    },

    /// A filter removed every row or column
    #[error("{stage}: no {what} left after filtering")]
    EmptyResult {
        /// filtering stage
        stage: &'static str,
        /// "cells" or "genes"
        what: &'static str,
    },

    /// A derived value is non-finite or non-positive where it must not be
    #[error("{stage}: degenerate input for {id}: {reason}")]
    DegenerateInput {
        /// stage that computed the value
        stage: &'static str,
        /// cell or gene identifier
        id: String,
        /// what is wrong with it
        reason: String,
    },

    /// More dimensions were requested than were computed
    #[error("{stage}: requested {requested} components but only {available} are available")]
    InsufficientComponents {
        /// stage that requested the dimensions
        stage: &'static str,
        /// number of requested components
        requested: usize,
        /// number of components actually present
        available: usize,
    },

    /// A stage was called on a dataset that lacks (or already has) a layer it depends on
    #[error("{stage}: {reason}")]
    StageOrder {
        /// stage that was called out of order
        stage: &'static str,
        /// what is missing or already present
        reason: String,
    },

    /// A stage parameter is outside its meaningful range
    #[error("{stage}: invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// stage owning the parameter
        stage: &'static str,
        /// parameter name
        name: &'static str,
        /// why it was rejected
        reason: String,
    },

    /// A persisted artifact does not decode into a consistent dataset
    #[error("corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact {
        /// artifact path
        path: PathBuf,
        /// decoding or validation message
        reason: String,
    },

    /// A persisted artifact was written with an incompatible schema
    #[error("artifact {} has schema version {found}, this build reads version {supported}", path.display())]
    UnsupportedVersion {
        /// artifact path
        path: PathBuf,
        /// version found in the artifact
        found: u32,
        /// version this build understands
        supported: u32,
    },

    /// Operating system I/O failure
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// file being read or written
        path: PathBuf,
        /// underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ScqcError {
    /// Wrap an I/O error with the path it happened on. Not-found errors become `MissingInput`.
    pub fn io(stage: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> ScqcError {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            ScqcError::MissingInput { stage, path }
        } else {
            ScqcError::Io { path, source }
        }
    }

    /// Shorthand for a `ShapeMismatch` over two extents.
    pub fn shape(
        stage: &'static str,
        what: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> ScqcError {
        ScqcError::ShapeMismatch {
            stage,
            what: what.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Result alias used across the workspace
pub type Result<T, E = ScqcError> = std::result::Result<T, E>;
