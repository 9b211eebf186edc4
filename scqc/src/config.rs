//! Pipeline configuration, read from JSON. Every field has a default, so a config file
//! only needs the knobs it changes.

use crate::cell_cycle::DEFAULT_PHASE_BASELINE;
use crate::embed::LouvainClusterer;
use crate::filter::{CellThresholds, DEFAULT_MIN_CELLS, DEFAULT_NMADS};
use crate::normalization::SizeFactorMethod;
use crate::qc::GeneSubset;
use crate::tsne::BarnesHutTsne;
use scqc_types::{Dataset, Result, ScqcError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STAGE: &str = "config";

/// How cell thresholds are chosen
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CellThresholdConfig {
    /// fixed values
    Fixed(CellThresholds),
    /// median +/- `nmads` MADs of the QC metrics of the dataset being filtered
    Adaptive {
        /// number of MADs
        nmads: f64,
    },
}

impl Default for CellThresholdConfig {
    fn default() -> Self {
        CellThresholdConfig::Fixed(CellThresholds::default())
    }
}

impl CellThresholdConfig {
    /// Adaptive thresholds with the default width
    pub fn adaptive() -> Self {
        CellThresholdConfig::Adaptive { nmads: DEFAULT_NMADS }
    }

    /// Concrete thresholds for `ds`
    pub fn resolve(&self, ds: &Dataset) -> Result<CellThresholds> {
        match *self {
            CellThresholdConfig::Fixed(t) => Ok(t),
            CellThresholdConfig::Adaptive { nmads } => CellThresholds::from_mad(ds, nmads),
        }
    }
}

/// Cell-cycle scoring settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellCycleConfig {
    /// both scores under this value mean G1
    pub baseline: f64,
    /// file with S-phase genes, one per line; the built-in list when absent
    pub s_genes: Option<PathBuf>,
    /// file with G2/M genes, one per line; the built-in list when absent
    pub g2m_genes: Option<PathBuf>,
}

impl Default for CellCycleConfig {
    fn default() -> Self {
        CellCycleConfig {
            baseline: DEFAULT_PHASE_BASELINE,
            s_genes: None,
            g2m_genes: None,
        }
    }
}

/// Principal component and downstream dimensionality settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbedConfig {
    /// highly variable genes fed to PCA
    pub n_top_genes: usize,
    /// principal components computed
    pub n_components: usize,
    /// scale genes to unit variance before PCA
    pub scale_genes: bool,
    /// seed of the randomized SVD
    pub pca_seed: u64,
    /// leading components fed to t-SNE
    pub tsne_dims: usize,
    /// leading components used for the neighbor graph
    pub cluster_dims: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        EmbedConfig {
            n_top_genes: 2000,
            n_components: 50,
            scale_genes: false,
            pca_seed: 0,
            tsne_dims: 50,
            cluster_dims: 50,
        }
    }
}

/// Knobs of every stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// gene subset whose share of counts is tracked by QC
    pub flagged_subset: GeneSubset,
    /// cell filter thresholds
    pub cell_thresholds: CellThresholdConfig,
    /// genes must be expressed in more than this many cells
    pub min_cells: u32,
    /// size factor estimation
    pub size_factors: SizeFactorMethod,
    /// cell-cycle scoring
    pub cell_cycle: CellCycleConfig,
    /// PCA and input dimensions of later stages
    pub embed: EmbedConfig,
    /// t-SNE parameters
    pub tsne: BarnesHutTsne,
    /// clustering parameters
    pub clustering: LouvainClusterer,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            flagged_subset: GeneSubset::default(),
            cell_thresholds: CellThresholdConfig::default(),
            min_cells: DEFAULT_MIN_CELLS,
            size_factors: SizeFactorMethod::default(),
            cell_cycle: CellCycleConfig::default(),
            embed: EmbedConfig::default(),
            tsne: BarnesHutTsne::default(),
            clustering: LouvainClusterer::default(),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<PipelineConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ScqcError::io(STAGE, path, e))?;
        let config: PipelineConfig = serde_json::from_str(&text).map_err(|e| ScqcError::MalformedInput {
            stage: STAGE,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject knob combinations no stage can run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &'static str, reason: String| -> Result<()> {
            Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name,
                reason,
            })
        };
        if !self.cell_cycle.baseline.is_finite() {
            return invalid("cell_cycle.baseline", format!("{} is not finite", self.cell_cycle.baseline));
        }
        let e = &self.embed;
        if e.n_top_genes == 0 || e.n_components == 0 {
            return invalid("embed", "gene and component counts must be positive".to_string());
        }
        for (name, dims) in [("embed.tsne_dims", e.tsne_dims), ("embed.cluster_dims", e.cluster_dims)] {
            if dims == 0 || dims > e.n_components {
                return invalid(
                    name,
                    format!("{dims} must be between 1 and n_components ({})", e.n_components),
                );
            }
        }
        if let CellThresholdConfig::Adaptive { nmads } = self.cell_thresholds {
            if !(nmads.is_finite() && nmads > 0.0) {
                return invalid("cell_thresholds.nmads", format!("{nmads} is not a positive number"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::GenePattern;

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "min_cells": 10,
                "cell_thresholds": {"mode": "adaptive", "nmads": 2.5},
                "flagged_subset": {"name": "ribo", "pattern": {"prefix": "RPL"}},
                "embed": {"n_components": 20, "tsne_dims": 10, "cluster_dims": 20},
                "tsne": {"perplexity": 15.0}
            }"#,
        )
        .unwrap();
        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.min_cells, 10);
        assert_eq!(config.cell_thresholds, CellThresholdConfig::Adaptive { nmads: 2.5 });
        assert_eq!(config.flagged_subset.pattern, GenePattern::Prefix("RPL".into()));
        assert_eq!(config.embed.n_top_genes, 2000);
        assert_eq!(config.tsne.perplexity, 15.0);
        assert_eq!(config.tsne.max_iter, 1000);
        assert_eq!(config.size_factors, SizeFactorMethod::Deconvolution);
    }

    #[test]
    fn rejects_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"min_cell": 10}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(&path),
            Err(ScqcError::MalformedInput { .. })
        ));
        std::fs::write(&path, r#"{"embed": {"n_components": 10}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(&path),
            Err(ScqcError::InvalidParameter { .. })
        ));
        assert!(matches!(
            PipelineConfig::from_json_file(tmp.path().join("absent.json")),
            Err(ScqcError::MissingInput { .. })
        ));
    }

    #[test]
    fn fixed_thresholds_round_trip() {
        let config = PipelineConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains(r#""mode":"fixed""#));
        let back: PipelineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
