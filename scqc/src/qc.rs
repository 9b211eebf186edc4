//! Per-cell and per-gene quality metrics.

use crate::stats::median;
use log::{info, warn};
use rayon::prelude::*;
use scqc_types::sparse::CountMatrix;
use scqc_types::{CellQc, Dataset, Result};
use serde::{Deserialize, Serialize};

/// Name prefix of mitochondrial genes in human references
pub const MITO_PREFIX: &str = "MT-";

/// A named set of genes whose share of each cell's counts is tracked
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneSubset {
    /// subset name, recorded in gene metadata
    pub name: String,
    /// how member genes are recognized
    pub pattern: GenePattern,
}

/// Gene membership rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenePattern {
    /// gene name starts with the prefix, ignoring ASCII case
    Prefix(String),
    /// gene name is one of the listed names
    Names(Vec<String>),
}

impl GeneSubset {
    /// Mitochondrial genes, recognized by the `MT-` prefix
    pub fn mitochondrial() -> GeneSubset {
        GeneSubset::prefix("mito", MITO_PREFIX)
    }

    /// Subset of genes whose name starts with `prefix`
    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> GeneSubset {
        GeneSubset {
            name: name.into(),
            pattern: GenePattern::Prefix(prefix.into()),
        }
    }

    /// True if `gene_name` belongs to the subset
    pub fn matches(&self, gene_name: &str) -> bool {
        match &self.pattern {
            GenePattern::Prefix(p) => gene_name
                .get(..p.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(p)),
            GenePattern::Names(names) => names.iter().any(|n| n == gene_name),
        }
    }
}

impl Default for GeneSubset {
    fn default() -> Self {
        GeneSubset::mitochondrial()
    }
}

/// Per-gene count of cells with a non-zero entry
pub fn n_expressing_cells(counts: &CountMatrix) -> Vec<u32> {
    let mut n = vec![0u32; counts.rows()];
    for col in counts.outer_iterator() {
        for (r, &v) in col.iter() {
            if v > 0 {
                n[r] += 1;
            }
        }
    }
    n
}

/// Per-cell metrics over a CSC count matrix, given a per-gene subset mask.
/// Columns are independent, so the reduction runs in parallel; output order is cell order.
pub fn cell_metrics(counts: &CountMatrix, flagged: &[bool]) -> CellQc {
    let per_cell: Vec<(u64, u32, u64)> = (0..counts.cols())
        .into_par_iter()
        .map(|c| {
            let mut total = 0u64;
            let mut detected = 0u32;
            let mut in_subset = 0u64;
            if let Some(col) = counts.outer_view(c) {
                for (r, &v) in col.iter() {
                    if v == 0 {
                        continue;
                    }
                    total += v as u64;
                    detected += 1;
                    if flagged[r] {
                        in_subset += v as u64;
                    }
                }
            }
            (total, detected, in_subset)
        })
        .collect();

    let mut qc = CellQc::default();
    for (total, detected, in_subset) in per_cell {
        qc.total_counts.push(total);
        qc.detected_features.push(detected);
        if total == 0 {
            qc.pct_flagged.push(0.0);
            qc.degenerate.push(true);
        } else {
            qc.pct_flagged.push(100.0 * in_subset as f64 / total as f64);
            qc.degenerate.push(false);
        }
    }
    qc
}

/// Computes QC metrics and returns an annotated copy of the dataset
#[derive(Clone, Debug, Default)]
pub struct QcMetricsComputer {
    subset: GeneSubset,
}

impl QcMetricsComputer {
    /// Track the share of counts in `subset`
    pub fn new(subset: GeneSubset) -> QcMetricsComputer {
        QcMetricsComputer { subset }
    }

    /// Annotate `ds` with per-cell and per-gene metrics
    pub fn compute(&self, ds: &Dataset) -> Result<Dataset> {
        let mut genes = ds.genes().clone();
        genes.is_flagged = genes.gene_names.iter().map(|n| self.subset.matches(n)).collect();
        genes.flagged_subset = Some(self.subset.name.clone());
        genes.n_expressing_cells = Some(n_expressing_cells(ds.counts()));

        let n_flagged = genes.is_flagged.iter().filter(|&&f| f).count();
        if n_flagged == 0 {
            warn!("no genes match the {} subset", self.subset.name);
        }

        let qc = cell_metrics(ds.counts(), &genes.is_flagged);
        let n_degenerate = qc.degenerate.iter().filter(|&&d| d).count();
        if n_degenerate > 0 {
            warn!("{n_degenerate} cells have zero total counts");
        }
        info!(
            "computed QC metrics for {} cells, {} genes ({} in subset {})",
            ds.n_cells(),
            ds.n_genes(),
            n_flagged,
            self.subset.name
        );

        let mut cells = ds.cells().clone();
        cells.qc = Some(qc);
        ds.clone().with_genes(genes)?.with_cells(cells)
    }
}

/// QC medians of one condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionQcSummary {
    /// condition label
    pub condition: String,
    /// number of cells
    pub cells: usize,
    /// cells with zero total counts
    pub degenerate: usize,
    /// median total counts, None when the condition has no cells
    pub median_total_counts: Option<f64>,
    /// median detected features
    pub median_detected_features: Option<f64>,
    /// median percentage of counts in the flagged subset
    pub median_pct_flagged: Option<f64>,
}

/// Summarize QC metrics per condition. Returns an empty list if QC has not run.
pub fn summarize_by_condition(ds: &Dataset) -> Vec<ConditionQcSummary> {
    let cells = ds.cells();
    let Some(qc) = &cells.qc else { return vec![] };
    cells
        .conditions
        .labels()
        .iter()
        .filter_map(|label| {
            let range = cells.conditions.cells_of(label)?;
            let totals: Vec<f64> = qc.total_counts[range.clone()].iter().map(|&x| x as f64).collect();
            let detected: Vec<f64> = qc.detected_features[range.clone()].iter().map(|&x| x as f64).collect();
            Some(ConditionQcSummary {
                condition: label.clone(),
                cells: range.len(),
                degenerate: qc.degenerate[range.clone()].iter().filter(|&&d| d).count(),
                median_total_counts: median(&totals),
                median_detected_features: median(&detected),
                median_pct_flagged: median(&qc.pct_flagged[range]),
            })
        })
        .collect()
}
