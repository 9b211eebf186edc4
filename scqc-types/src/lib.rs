//! Shared types for the scqc workspace: the annotated count matrix and its error type.

#![deny(missing_docs)]

/// Annotated dataset and its metadata tables
pub mod dataset;

/// Error kinds shared by every stage
pub mod error;

/// Per-cell condition labels
pub mod label_class;

/// Sparse matrix helpers
pub mod sparse;

pub use dataset::{CellCycle, CellMetadata, CellQc, Dataset, DatasetParts, GeneMetadata, Phase};
pub use error::{Result, ScqcError};
pub use label_class::Conditions;
pub use sparse::{CountMatrix, ExprMatrix};
