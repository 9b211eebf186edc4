use crate::error::{Result, ScqcError};
use crate::label_class::Conditions;
use crate::sparse::{select_cols, select_rows, CountMatrix, ExprMatrix};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const STAGE: &str = "dataset";

/// Discrete cell-cycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Neither signature is expressed above baseline
    G1,
    /// S-phase signature dominates
    S,
    /// G2/M signature dominates
    G2M,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::G1 => "G1",
            Phase::S => "S",
            Phase::G2M => "G2M",
        })
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G1" => Ok(Phase::G1),
            "S" => Ok(Phase::S),
            "G2M" => Ok(Phase::G2M),
            _ => Err(format!("unknown cell-cycle phase: {s}")),
        }
    }
}

/// Per-cell quality metrics
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CellQc {
    /// Sum of the cell's column
    pub total_counts: Vec<u64>,
    /// Number of non-zero entries in the cell's column
    pub detected_features: Vec<u32>,
    /// Percentage of the cell's counts falling in the flagged gene subset
    pub pct_flagged: Vec<f64>,
    /// Cells with zero total counts
    pub degenerate: Vec<bool>,
}

/// Per-cell cell-cycle scores and assigned phase
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CellCycle {
    /// Mean normalized expression of the S-phase signature
    pub s_score: Vec<f64>,
    /// Mean normalized expression of the G2M signature
    pub g2m_score: Vec<f64>,
    /// Assigned phase
    pub phase: Vec<Phase>,
}

/// Cell metadata table, one row per matrix column
#[derive(Clone, Debug, PartialEq)]
pub struct CellMetadata {
    /// Unique cell identifiers (barcode plus a suffix where barcodes collide)
    pub cell_ids: Vec<String>,
    /// Barcodes as read from the input
    pub barcodes: Vec<String>,
    /// Source library of each cell
    pub conditions: Conditions,
    /// Set by the cell filter for cells failing a QC predicate
    pub is_filtered_out: Vec<bool>,
    /// Present once QC metrics were computed
    pub qc: Option<CellQc>,
    /// Present once cell-cycle scoring ran
    pub cell_cycle: Option<CellCycle>,
}

impl CellMetadata {
    /// A fresh table with no derived columns
    pub fn new(cell_ids: Vec<String>, barcodes: Vec<String>, conditions: Conditions) -> CellMetadata {
        let n = cell_ids.len();
        CellMetadata {
            cell_ids,
            barcodes,
            conditions,
            is_filtered_out: vec![false; n],
            qc: None,
            cell_cycle: None,
        }
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    /// True if the table has no cells
    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let n = self.len();
        let check = |what: &str, len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(ScqcError::shape(STAGE, format!("cell metadata column {what}"), n, len))
            }
        };
        check("barcode", self.barcodes.len())?;
        check("condition", self.conditions.n_cells())?;
        check("is_filtered_out", self.is_filtered_out.len())?;
        if let Some(qc) = &self.qc {
            check("total_counts", qc.total_counts.len())?;
            check("detected_feature_count", qc.detected_features.len())?;
            check("pct_flagged_subset", qc.pct_flagged.len())?;
            check("degenerate", qc.degenerate.len())?;
        }
        if let Some(cc) = &self.cell_cycle {
            check("s_score", cc.s_score.len())?;
            check("g2m_score", cc.g2m_score.len())?;
            check("phase", cc.phase.len())?;
        }
        Ok(())
    }

    fn select(&self, keep: &[usize]) -> CellMetadata {
        CellMetadata {
            cell_ids: pick(&self.cell_ids, keep),
            barcodes: pick(&self.barcodes, keep),
            conditions: self.conditions.select(keep),
            is_filtered_out: pick(&self.is_filtered_out, keep),
            qc: self.qc.as_ref().map(|qc| CellQc {
                total_counts: pick(&qc.total_counts, keep),
                detected_features: pick(&qc.detected_features, keep),
                pct_flagged: pick(&qc.pct_flagged, keep),
                degenerate: pick(&qc.degenerate, keep),
            }),
            cell_cycle: self.cell_cycle.as_ref().map(|cc| CellCycle {
                s_score: pick(&cc.s_score, keep),
                g2m_score: pick(&cc.g2m_score, keep),
                phase: pick(&cc.phase, keep),
            }),
        }
    }
}

/// Gene metadata table, one row per matrix row
#[derive(Clone, Debug, PartialEq)]
pub struct GeneMetadata {
    /// Stable gene identifiers (e.g. Ensembl ids)
    pub gene_ids: Vec<String>,
    /// Gene symbols
    pub gene_names: Vec<String>,
    /// Feature type column of the feature table, "Gene Expression" when absent
    pub feature_types: Vec<String>,
    /// Name of the flagged gene subset, once QC flagged one
    pub flagged_subset: Option<String>,
    /// Membership in the flagged subset
    pub is_flagged: Vec<bool>,
    /// Number of cells with a non-zero count, once computed
    pub n_expressing_cells: Option<Vec<u32>>,
}

impl GeneMetadata {
    /// A fresh table with no derived columns
    pub fn new(gene_ids: Vec<String>, gene_names: Vec<String>, feature_types: Vec<String>) -> GeneMetadata {
        let n = gene_ids.len();
        GeneMetadata {
            gene_ids,
            gene_names,
            feature_types,
            flagged_subset: None,
            is_flagged: vec![false; n],
            n_expressing_cells: None,
        }
    }

    /// Number of genes
    pub fn len(&self) -> usize {
        self.gene_ids.len()
    }

    /// True if the table has no genes
    pub fn is_empty(&self) -> bool {
        self.gene_ids.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let n = self.len();
        let check = |what: &str, len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(ScqcError::shape(STAGE, format!("gene metadata column {what}"), n, len))
            }
        };
        check("gene_name", self.gene_names.len())?;
        check("feature_type", self.feature_types.len())?;
        check("is_flagged_subset", self.is_flagged.len())?;
        if let Some(n_cells) = &self.n_expressing_cells {
            check("n_expressing_cells", n_cells.len())?;
        }
        Ok(())
    }

    fn select(&self, keep: &[usize]) -> GeneMetadata {
        GeneMetadata {
            gene_ids: pick(&self.gene_ids, keep),
            gene_names: pick(&self.gene_names, keep),
            feature_types: pick(&self.feature_types, keep),
            flagged_subset: self.flagged_subset.clone(),
            is_flagged: pick(&self.is_flagged, keep),
            n_expressing_cells: self.n_expressing_cells.as_ref().map(|n| pick(n, keep)),
        }
    }
}

fn pick<T: Clone>(xs: &[T], keep: &[usize]) -> Vec<T> {
    keep.iter().map(|&i| xs[i].clone()).collect()
}

/// Every component of a [`Dataset`], with public fields. Used to move a dataset
/// across a serialization boundary; [`Dataset::from_parts`] validates it.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetParts {
    /// genes x cells counts
    pub counts: CountMatrix,
    /// cell table
    pub cells: CellMetadata,
    /// gene table
    pub genes: GeneMetadata,
    /// per-cell size factors
    pub size_factors: Option<Vec<f64>>,
    /// log-normalized genes x cells layer
    pub normalized: Option<ExprMatrix>,
    /// named cells x dims coordinate tables
    pub embeddings: BTreeMap<String, Array2<f64>>,
    /// per-cell cluster labels
    pub clusters: Option<Vec<u32>>,
}

/// Annotated genes x cells count matrix.
///
/// Every stage takes a `&Dataset` and returns a new one: annotations are added
/// to a copy, filters return a subset. Invariants (checked on construction):
/// the count matrix is stored by column, its shape matches both metadata tables,
/// and every optional layer has one entry per cell (or the same shape as the counts).
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    counts: CountMatrix,
    cells: CellMetadata,
    genes: GeneMetadata,
    size_factors: Option<Vec<f64>>,
    normalized: Option<ExprMatrix>,
    embeddings: BTreeMap<String, Array2<f64>>,
    clusters: Option<Vec<u32>>,
}

impl Dataset {
    /// Build a dataset from raw counts and metadata tables
    pub fn new(counts: CountMatrix, cells: CellMetadata, genes: GeneMetadata) -> Result<Dataset> {
        Dataset::from_parts(DatasetParts {
            counts,
            cells,
            genes,
            size_factors: None,
            normalized: None,
            embeddings: BTreeMap::new(),
            clusters: None,
        })
    }

    /// Validate and assemble a dataset from its parts
    pub fn from_parts(parts: DatasetParts) -> Result<Dataset> {
        let counts = if parts.counts.is_csc() {
            parts.counts
        } else {
            parts.counts.to_csc()
        };
        let ds = Dataset {
            counts,
            cells: parts.cells,
            genes: parts.genes,
            size_factors: parts.size_factors,
            normalized: parts.normalized,
            embeddings: parts.embeddings,
            clusters: parts.clusters,
        };
        ds.validate()?;
        Ok(ds)
    }

    /// Take the dataset apart
    pub fn into_parts(self) -> DatasetParts {
        DatasetParts {
            counts: self.counts,
            cells: self.cells,
            genes: self.genes,
            size_factors: self.size_factors,
            normalized: self.normalized,
            embeddings: self.embeddings,
            clusters: self.clusters,
        }
    }

    fn validate(&self) -> Result<()> {
        self.cells.validate()?;
        self.genes.validate()?;
        let (n_genes, n_cells) = (self.n_genes(), self.n_cells());
        if self.counts.rows() != n_genes {
            return Err(ScqcError::shape(STAGE, "count matrix rows", n_genes, self.counts.rows()));
        }
        if self.counts.cols() != n_cells {
            return Err(ScqcError::shape(STAGE, "count matrix columns", n_cells, self.counts.cols()));
        }
        if let Some(sf) = &self.size_factors {
            if sf.len() != n_cells {
                return Err(ScqcError::shape(STAGE, "size factors", n_cells, sf.len()));
            }
        }
        if let Some(norm) = &self.normalized {
            if norm.shape() != (n_genes, n_cells) || !norm.is_csc() {
                return Err(ScqcError::shape(
                    STAGE,
                    "normalized layer",
                    format!("{n_genes} x {n_cells}"),
                    format!("{} x {}", norm.rows(), norm.cols()),
                ));
            }
        }
        for (name, coords) in &self.embeddings {
            if coords.nrows() != n_cells {
                return Err(ScqcError::shape(STAGE, format!("embedding {name}"), n_cells, coords.nrows()));
            }
        }
        if let Some(clusters) = &self.clusters {
            if clusters.len() != n_cells {
                return Err(ScqcError::shape(STAGE, "cluster labels", n_cells, clusters.len()));
            }
        }
        Ok(())
    }

    /// Number of cells (matrix columns)
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of genes (matrix rows)
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Raw counts, genes x cells
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    /// Cell table
    pub fn cells(&self) -> &CellMetadata {
        &self.cells
    }

    /// Gene table
    pub fn genes(&self) -> &GeneMetadata {
        &self.genes
    }

    /// Per-cell size factors, present after normalization
    pub fn size_factors(&self) -> Option<&[f64]> {
        self.size_factors.as_deref()
    }

    /// Log-normalized layer, present after normalization
    pub fn normalized(&self) -> Option<&ExprMatrix> {
        self.normalized.as_ref()
    }

    /// All embeddings by name
    pub fn embeddings(&self) -> &BTreeMap<String, Array2<f64>> {
        &self.embeddings
    }

    /// Embedding called `name`
    pub fn embedding(&self, name: &str) -> Option<&Array2<f64>> {
        self.embeddings.get(name)
    }

    /// Cluster labels, present after clustering
    pub fn clusters(&self) -> Option<&[u32]> {
        self.clusters.as_deref()
    }

    /// Replace the cell table. The new table must describe the same cells.
    pub fn with_cells(mut self, cells: CellMetadata) -> Result<Dataset> {
        self.cells = cells;
        self.validate()?;
        Ok(self)
    }

    /// Replace the gene table. The new table must describe the same genes.
    pub fn with_genes(mut self, genes: GeneMetadata) -> Result<Dataset> {
        self.genes = genes;
        self.validate()?;
        Ok(self)
    }

    /// Attach size factors and the normalized layer
    pub fn with_normalized(mut self, size_factors: Vec<f64>, normalized: ExprMatrix) -> Result<Dataset> {
        self.size_factors = Some(size_factors);
        self.normalized = Some(normalized);
        self.validate()?;
        Ok(self)
    }

    /// Attach (or replace) the embedding `name`
    pub fn with_embedding(mut self, name: impl Into<String>, coords: Array2<f64>) -> Result<Dataset> {
        self.embeddings.insert(name.into(), coords);
        self.validate()?;
        Ok(self)
    }

    /// Attach cluster labels
    pub fn with_clusters(mut self, clusters: Vec<u32>) -> Result<Dataset> {
        self.clusters = Some(clusters);
        self.validate()?;
        Ok(self)
    }

    /// A new dataset holding only the cells at `keep` (sorted, unique). Every
    /// per-cell layer is subset alongside the matrix.
    pub fn select_cells(&self, keep: &[usize]) -> Dataset {
        Dataset {
            counts: select_cols(&self.counts, keep),
            cells: self.cells.select(keep),
            genes: self.genes.clone(),
            size_factors: self.size_factors.as_ref().map(|sf| pick(sf, keep)),
            normalized: self.normalized.as_ref().map(|m| select_cols(m, keep)),
            embeddings: self
                .embeddings
                .iter()
                .map(|(name, coords)| (name.clone(), coords.select(Axis(0), keep)))
                .collect(),
            clusters: self.clusters.as_ref().map(|c| pick(c, keep)),
        }
    }

    /// A new dataset holding only the genes at `keep` (sorted, unique).
    pub fn select_genes(&self, keep: &[usize]) -> Dataset {
        Dataset {
            counts: select_rows(&self.counts, keep),
            cells: self.cells.clone(),
            genes: self.genes.select(keep),
            size_factors: self.size_factors.clone(),
            normalized: self.normalized.as_ref().map(|m| select_rows(m, keep)),
            embeddings: self.embeddings.clone(),
            clusters: self.clusters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    pub(crate) fn toy() -> Dataset {
        let mut t = TriMat::new((3, 4));
        t.add_triplet(0, 0, 4u32);
        t.add_triplet(1, 1, 2);
        t.add_triplet(2, 2, 1);
        t.add_triplet(0, 3, 3);
        t.add_triplet(1, 3, 1);
        let cells = CellMetadata::new(
            (0..4).map(|i| format!("c{i}")).collect(),
            (0..4).map(|i| format!("c{i}")).collect(),
            Conditions::from_block_sizes(vec!["a".into(), "b".into()], &[2, 2]).unwrap(),
        );
        let genes = GeneMetadata::new(
            vec!["g0".into(), "g1".into(), "g2".into()],
            vec!["MT-A".into(), "B".into(), "C".into()],
            vec!["Gene Expression".into(); 3],
        );
        Dataset::new(t.to_csc(), cells, genes).unwrap()
    }

    #[test]
    fn shape_is_validated() {
        let ds = toy();
        let parts = ds.clone().into_parts();
        let mut bad = parts.clone();
        bad.genes.gene_ids.pop();
        bad.genes.gene_names.pop();
        bad.genes.feature_types.pop();
        bad.genes.is_flagged.pop();
        assert!(matches!(Dataset::from_parts(bad), Err(ScqcError::ShapeMismatch { .. })));

        let mut bad = parts.clone();
        bad.clusters = Some(vec![0; 3]);
        assert!(Dataset::from_parts(bad).is_err());

        assert_eq!(Dataset::from_parts(parts).unwrap(), ds);
    }

    #[test]
    fn select_keeps_layers_aligned() {
        let ds = toy()
            .with_embedding("pca", Array2::from_shape_fn((4, 2), |(i, j)| (i * 10 + j) as f64))
            .unwrap()
            .with_clusters(vec![0, 1, 2, 3])
            .unwrap();
        let sub = ds.select_cells(&[1, 3]);
        assert_eq!(sub.n_cells(), 2);
        assert_eq!(sub.clusters(), Some(&[1, 3][..]));
        assert_eq!(sub.embedding("pca").unwrap()[[1, 1]], 31.0);
        assert_eq!(sub.cells().conditions.block_sizes(), vec![1, 1]);
        assert_eq!(sub.counts().get(0, 1), Some(&3));

        let sub = ds.select_genes(&[1]);
        assert_eq!(sub.n_genes(), 1);
        assert_eq!(sub.genes().gene_names, vec!["B".to_string()]);
        assert_eq!(sub.counts().nnz(), 2);
    }
}
