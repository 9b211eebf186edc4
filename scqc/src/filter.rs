//! Cell and gene filters. Filters never modify their input: they return a subset.

use crate::qc::n_expressing_cells;
use crate::stats::{median_abs_dev, MAD_NORMAL_SCALE};
use log::info;
use scqc_types::{CellQc, Dataset, Result, ScqcError};
use serde::{Deserialize, Serialize};

const CELL_STAGE: &str = "filter-cells";
const GENE_STAGE: &str = "filter-genes";

/// Default number of MADs for adaptive thresholds
pub const DEFAULT_NMADS: f64 = 3.0;

/// Default gene filter threshold: genes must be expressed in more than this many cells
pub const DEFAULT_MIN_CELLS: u32 = 3;

/// Per-cell QC thresholds. A cell is kept iff
/// `total_counts > min_total_counts && detected_feature_count > min_detected_features
///  && pct_flagged_subset < max_pct_flagged`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellThresholds {
    /// exclusive lower bound on total counts
    pub min_total_counts: f64,
    /// exclusive lower bound on detected features
    pub min_detected_features: f64,
    /// exclusive upper bound on the flagged-subset percentage
    pub max_pct_flagged: f64,
}

impl Default for CellThresholds {
    fn default() -> Self {
        CellThresholds {
            min_total_counts: 1000.0,
            min_detected_features: 300.0,
            max_pct_flagged: 25.0,
        }
    }
}

impl CellThresholds {
    /// Fixed thresholds
    pub fn new(min_total_counts: f64, min_detected_features: f64, max_pct_flagged: f64) -> CellThresholds {
        CellThresholds {
            min_total_counts,
            min_detected_features,
            max_pct_flagged,
        }
    }

    /// Outlier-based thresholds: cells more than `nmads` scaled MADs below the median
    /// log total counts or log detected features, or above the median flagged percentage,
    /// fail. Degenerate cells are left out of the estimates.
    pub fn from_mad(ds: &Dataset, nmads: f64) -> Result<CellThresholds> {
        if !(nmads.is_finite() && nmads > 0.0) {
            return Err(ScqcError::InvalidParameter {
                stage: CELL_STAGE,
                name: "nmads",
                reason: format!("{nmads} is not a positive number"),
            });
        }
        let qc = require_qc(ds)?;
        let live: Vec<usize> = (0..qc.degenerate.len()).filter(|&i| !qc.degenerate[i]).collect();
        let log_totals: Vec<f64> = live.iter().map(|&i| (qc.total_counts[i] as f64).ln()).collect();
        let log_detected: Vec<f64> = live
            .iter()
            .map(|&i| (qc.detected_features[i] as f64).ln())
            .collect();
        let pct: Vec<f64> = live.iter().map(|&i| qc.pct_flagged[i]).collect();

        let bound = |xs: &[f64], sign: f64| -> Result<f64> {
            let (m, mad) = median_abs_dev(xs).ok_or_else(|| ScqcError::EmptyResult {
                stage: CELL_STAGE,
                what: "cells with non-zero counts",
            })?;
            Ok(m + sign * nmads * MAD_NORMAL_SCALE * mad)
        };
        let thresholds = CellThresholds {
            min_total_counts: bound(&log_totals, -1.0)?.exp(),
            min_detected_features: bound(&log_detected, -1.0)?.exp(),
            max_pct_flagged: bound(&pct, 1.0)?,
        };
        info!("adaptive cell thresholds ({nmads} MADs): {thresholds:?}");
        Ok(thresholds)
    }

    fn check(&self) -> Result<()> {
        for (name, v) in [
            ("min_total_counts", self.min_total_counts),
            ("min_detected_features", self.min_detected_features),
            ("max_pct_flagged", self.max_pct_flagged),
        ] {
            if v.is_nan() {
                return Err(ScqcError::InvalidParameter {
                    stage: CELL_STAGE,
                    name,
                    reason: "threshold is NaN".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn require_qc(ds: &Dataset) -> Result<&CellQc> {
    ds.cells().qc.as_ref().ok_or_else(|| ScqcError::StageOrder {
        stage: CELL_STAGE,
        reason: "QC metrics have not been computed".to_string(),
    })
}

/// Observable result of the cell filter
#[derive(Clone, Debug, PartialEq)]
pub struct CellFilterOutcome {
    /// surviving cells
    pub dataset: Dataset,
    /// cells before filtering
    pub cells_before: usize,
    /// cells after filtering
    pub cells_after: usize,
    /// cells failing the total-count predicate
    pub failed_total_counts: usize,
    /// cells failing the detected-feature predicate
    pub failed_detected_features: usize,
    /// cells failing the flagged-percentage predicate
    pub failed_pct_flagged: usize,
    /// surviving cells per condition, in condition order
    pub survivors_by_condition: Vec<(String, usize)>,
}

/// Removes low-quality cells
#[derive(Clone, Copy, Debug, Default)]
pub struct CellFilter {
    thresholds: CellThresholds,
}

impl CellFilter {
    /// Filter with `thresholds`
    pub fn new(thresholds: CellThresholds) -> CellFilter {
        CellFilter { thresholds }
    }

    /// Thresholds in use
    pub fn thresholds(&self) -> &CellThresholds {
        &self.thresholds
    }

    /// Return a copy of `ds` with `is_filtered_out` set for every cell failing a predicate
    pub fn flag(&self, ds: &Dataset) -> Result<Dataset> {
        self.thresholds.check()?;
        let qc = require_qc(ds)?;
        let t = &self.thresholds;
        let mut cells = ds.cells().clone();
        cells.is_filtered_out = (0..ds.n_cells())
            .map(|i| {
                !((qc.total_counts[i] as f64) > t.min_total_counts
                    && (qc.detected_features[i] as f64) > t.min_detected_features
                    && qc.pct_flagged[i] < t.max_pct_flagged)
            })
            .collect();
        ds.clone().with_cells(cells)
    }

    /// Flag failing cells and return the subset of passing cells, with gene
    /// expression counts recomputed over the survivors
    pub fn apply(&self, ds: &Dataset) -> Result<CellFilterOutcome> {
        let flagged = self.flag(ds)?;
        let qc = require_qc(ds)?;
        let t = &self.thresholds;
        let failed_total_counts = qc
            .total_counts
            .iter()
            .filter(|&&x| (x as f64) <= t.min_total_counts)
            .count();
        let failed_detected_features = qc
            .detected_features
            .iter()
            .filter(|&&x| (x as f64) <= t.min_detected_features)
            .count();
        let failed_pct_flagged = qc.pct_flagged.iter().filter(|&&x| x >= t.max_pct_flagged).count();

        let keep: Vec<usize> = flagged
            .cells()
            .is_filtered_out
            .iter()
            .enumerate()
            .filter_map(|(i, &out)| (!out).then_some(i))
            .collect();
        if keep.is_empty() {
            return Err(ScqcError::EmptyResult {
                stage: CELL_STAGE,
                what: "cells",
            });
        }

        let subset = flagged.select_cells(&keep);
        let dataset = if subset.genes().n_expressing_cells.is_some() {
            let mut genes = subset.genes().clone();
            genes.n_expressing_cells = Some(n_expressing_cells(subset.counts()));
            subset.with_genes(genes)?
        } else {
            subset
        };

        let conditions = &dataset.cells().conditions;
        let survivors_by_condition = conditions
            .labels()
            .iter()
            .cloned()
            .zip(conditions.block_sizes())
            .collect();
        info!(
            "cell filter kept {} of {} cells ({} low counts, {} low features, {} high flagged %)",
            keep.len(),
            ds.n_cells(),
            failed_total_counts,
            failed_detected_features,
            failed_pct_flagged
        );
        Ok(CellFilterOutcome {
            cells_before: ds.n_cells(),
            cells_after: dataset.n_cells(),
            dataset,
            failed_total_counts,
            failed_detected_features,
            failed_pct_flagged,
            survivors_by_condition,
        })
    }
}

/// Observable result of the gene filter
#[derive(Clone, Debug, PartialEq)]
pub struct GeneFilterOutcome {
    /// surviving genes
    pub dataset: Dataset,
    /// genes before filtering
    pub genes_before: usize,
    /// genes after filtering
    pub genes_after: usize,
}

/// Removes genes expressed in too few cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneFilter {
    min_cells: u32,
}

impl GeneFilter {
    /// Keep genes with `n_expressing_cells > min_cells`
    pub fn new(min_cells: u32) -> GeneFilter {
        GeneFilter { min_cells }
    }

    /// Return the subset of genes passing the threshold
    pub fn apply(&self, ds: &Dataset) -> Result<GeneFilterOutcome> {
        let n_cells = match &ds.genes().n_expressing_cells {
            Some(n) => n.clone(),
            None => n_expressing_cells(ds.counts()),
        };
        let keep: Vec<usize> = (0..ds.n_genes()).filter(|&g| n_cells[g] > self.min_cells).collect();
        if keep.is_empty() {
            return Err(ScqcError::EmptyResult {
                stage: GENE_STAGE,
                what: "genes",
            });
        }
        let mut dataset = ds.select_genes(&keep);
        if dataset.genes().n_expressing_cells.is_none() {
            let mut genes = dataset.genes().clone();
            genes.n_expressing_cells = Some(keep.iter().map(|&g| n_cells[g]).collect());
            dataset = dataset.with_genes(genes)?;
        }
        info!(
            "gene filter kept {} of {} genes expressed in more than {} cells",
            keep.len(),
            ds.n_genes(),
            self.min_cells
        );
        Ok(GeneFilterOutcome {
            genes_before: ds.n_genes(),
            genes_after: dataset.n_genes(),
            dataset,
        })
    }
}
