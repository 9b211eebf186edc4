//! # scqc: single-cell quality control, normalization and clustering

#![deny(missing_docs)]

/// Cell-cycle phase scoring
pub mod cell_cycle;

/// Pipeline configuration
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Embedding and clustering stage
pub mod embed;

/// Cell and gene filters
pub mod filter;

/// Multi-condition matrix loading
pub mod loader;

/// Louvain community detection
pub mod louvain;

/// MTX loading routine
pub mod mtx;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// All stages chained
pub mod pipeline;

/// Quality-control metrics
pub mod qc;

/// Statistics functions
pub mod stats;

/// Barnes-Hut t-SNE
pub mod tsne;

pub use loader::{ConditionInput, MatrixLoader};
pub use pipeline::{Pipeline, PipelineReport};
