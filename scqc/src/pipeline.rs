//! The stages chained in their fixed order, driven by a [`PipelineConfig`].
//!
//! Each stage method takes the previous stage's dataset and returns a new one, so a
//! caller can stop, persist and resume anywhere. [`Pipeline::run_all`] runs everything
//! and persists the scored dataset (the recovery point before the numerically heavy
//! stages) and the final clustered dataset.

use crate::cell_cycle::{load_gene_list, CellCycleScorer, G2M_PHASE_GENES, S_PHASE_GENES};
use crate::config::PipelineConfig;
use crate::dim_red::{top_variable_genes, RandSvd};
use crate::embed::{EmbeddingAndClusterer, LouvainClusterer, PCA_EMBEDDING};
use crate::filter::{CellFilter, CellFilterOutcome, CellThresholds, GeneFilter, GeneFilterOutcome};
use crate::loader::{ConditionInput, MatrixLoader};
use crate::normalization::Normalizer;
use crate::qc::{summarize_by_condition, ConditionQcSummary, QcMetricsComputer};
use crate::tsne::BarnesHutTsne;
use log::info;
use scqc_store::DatasetStore;
use scqc_types::{Dataset, Phase, Result, ScqcError};
use serde::Serialize;
use std::path::{Path, PathBuf};

const STAGE: &str = "run-all";

/// Artifact written after cell-cycle scoring
pub const SCORED_ARTIFACT: &str = "scored.json.gz";

/// Artifact written after clustering
pub const CLUSTERED_ARTIFACT: &str = "clustered.json.gz";

type DefaultEmbedder = EmbeddingAndClusterer<RandSvd, BarnesHutTsne, LouvainClusterer>;

/// What a full run observed
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineReport {
    /// cells after loading
    pub cells_loaded: usize,
    /// genes after loading
    pub genes_loaded: usize,
    /// QC medians per condition, before filtering
    pub qc_by_condition: Vec<ConditionQcSummary>,
    /// thresholds the cell filter applied
    pub thresholds: CellThresholds,
    /// cells surviving the cell filter
    pub cells_kept: usize,
    /// cells failing the total-count predicate
    pub failed_total_counts: usize,
    /// cells failing the detected-feature predicate
    pub failed_detected_features: usize,
    /// cells failing the flagged-percentage predicate
    pub failed_pct_flagged: usize,
    /// surviving cells per condition
    pub survivors_by_condition: Vec<(String, usize)>,
    /// genes surviving the gene filter
    pub genes_kept: usize,
    /// cells per cell-cycle phase
    pub phases: Vec<(Phase, usize)>,
    /// number of clusters found
    pub n_clusters: usize,
    /// dataset saved after cell-cycle scoring
    pub scored_artifact: PathBuf,
    /// dataset saved after clustering
    pub clustered_artifact: PathBuf,
}

/// Runs pipeline stages with one configuration
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Pipeline over a validated `config`
    pub fn new(config: PipelineConfig) -> Result<Pipeline> {
        config.validate()?;
        Ok(Pipeline { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load and merge the condition directories
    pub fn load(&self, inputs: &[ConditionInput]) -> Result<Dataset> {
        MatrixLoader::new(inputs.to_vec()).load()
    }

    /// Per-cell and per-gene QC metrics
    pub fn qc(&self, ds: &Dataset) -> Result<Dataset> {
        QcMetricsComputer::new(self.config.flagged_subset.clone()).compute(ds)
    }

    /// Resolve the configured thresholds against `ds` and drop failing cells
    pub fn filter_cells(&self, ds: &Dataset) -> Result<CellFilterOutcome> {
        let thresholds = self.config.cell_thresholds.resolve(ds)?;
        CellFilter::new(thresholds).apply(ds)
    }

    /// Drop genes expressed in too few cells
    pub fn filter_genes(&self, ds: &Dataset) -> Result<GeneFilterOutcome> {
        GeneFilter::new(self.config.min_cells).apply(ds)
    }

    /// Size factors and the log-normalized layer
    pub fn normalize(&self, ds: &Dataset) -> Result<Dataset> {
        Normalizer::new(self.config.size_factors.estimator()).normalize(ds)
    }

    /// Scorer with the configured signatures; a missing file falls back to the built-in list
    pub fn cell_cycle_scorer(&self) -> Result<CellCycleScorer> {
        let cc = &self.config.cell_cycle;
        let signature = |path: &Option<PathBuf>, builtin: &[&str]| match path {
            Some(p) => load_gene_list(p),
            None => Ok(builtin.iter().map(|g| g.to_string()).collect()),
        };
        let s_genes = signature(&cc.s_genes, S_PHASE_GENES)?;
        let g2m_genes = signature(&cc.g2m_genes, G2M_PHASE_GENES)?;
        Ok(CellCycleScorer::new(s_genes, g2m_genes).with_baseline(cc.baseline))
    }

    /// Cell-cycle scores and phases
    pub fn cell_cycle(&self, ds: &Dataset) -> Result<Dataset> {
        self.cell_cycle_scorer()?.score(ds)
    }

    fn embedder(&self) -> DefaultEmbedder {
        let pca = RandSvd {
            seed: self.config.embed.pca_seed,
            ..RandSvd::new()
        };
        EmbeddingAndClusterer::new(pca, self.config.tsne.clone(), self.config.clustering.clone())
            .with_scaling(self.config.embed.scale_genes)
    }

    /// Principal components over the most variable genes, then t-SNE on the leading ones
    pub fn embed(&self, ds: &Dataset) -> Result<Dataset> {
        let e = &self.config.embed;
        let genes = top_variable_genes(ds, e.n_top_genes)?;
        let embedder = self.embedder();
        let with_pca = embedder.run_pca(ds, &genes, e.n_components)?;
        embedder.run_embedding(&with_pca, PCA_EMBEDDING, e.tsne_dims)
    }

    /// Graph clustering on the leading principal components
    pub fn cluster(&self, ds: &Dataset) -> Result<Dataset> {
        self.embedder()
            .run_clustering(ds, PCA_EMBEDDING, self.config.embed.cluster_dims)
    }

    /// Every stage in order, persisting into `out_dir`
    pub fn run_all(&self, inputs: &[ConditionInput], out_dir: &Path) -> Result<PipelineReport> {
        std::fs::create_dir_all(out_dir).map_err(|e| ScqcError::io(STAGE, out_dir, e))?;

        let raw = self.load(inputs)?;
        let with_qc = self.qc(&raw)?;
        let qc_by_condition = summarize_by_condition(&with_qc);
        for s in &qc_by_condition {
            info!(
                "{}: {} cells, median counts {:?}, median features {:?}, median flagged % {:?}",
                s.condition, s.cells, s.median_total_counts, s.median_detected_features, s.median_pct_flagged
            );
        }

        let thresholds = self.config.cell_thresholds.resolve(&with_qc)?;
        let cells = CellFilter::new(thresholds).apply(&with_qc)?;
        let genes = self.filter_genes(&cells.dataset)?;
        let normalized = self.normalize(&genes.dataset)?;
        let scored = self.cell_cycle(&normalized)?;
        let scored_artifact = out_dir.join(SCORED_ARTIFACT);
        DatasetStore::save(&scored, &scored_artifact)?;

        let embedded = self.embed(&scored)?;
        let clustered = self.cluster(&embedded)?;
        let clustered_artifact = out_dir.join(CLUSTERED_ARTIFACT);
        DatasetStore::save(&clustered, &clustered_artifact)?;

        let phases = scored
            .cells()
            .cell_cycle
            .as_ref()
            .map(|cc| {
                [Phase::S, Phase::G2M, Phase::G1]
                    .into_iter()
                    .map(|p| (p, cc.phase.iter().filter(|&&x| x == p).count()))
                    .collect()
            })
            .unwrap_or_default();
        let n_clusters = clustered
            .clusters()
            .and_then(|c| c.iter().max())
            .map_or(0, |&m| m as usize + 1);
        info!(
            "run complete: {} of {} cells, {} of {} genes, {} clusters",
            clustered.n_cells(),
            raw.n_cells(),
            clustered.n_genes(),
            raw.n_genes(),
            n_clusters
        );

        Ok(PipelineReport {
            cells_loaded: raw.n_cells(),
            genes_loaded: raw.n_genes(),
            qc_by_condition,
            thresholds,
            cells_kept: cells.cells_after,
            failed_total_counts: cells.failed_total_counts,
            failed_detected_features: cells.failed_detected_features,
            failed_pct_flagged: cells.failed_pct_flagged,
            survivors_by_condition: cells.survivors_by_condition,
            genes_kept: genes.genes_after,
            phases,
            n_clusters,
            scored_artifact,
            clustered_artifact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellThresholdConfig;
    use crate::qc::tests::small_dataset;

    #[test]
    fn rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.embed.tsne_dims = 0;
        assert!(matches!(
            Pipeline::new(config),
            Err(ScqcError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn stages_chain_on_small_data() {
        let mut config = PipelineConfig::default();
        config.cell_thresholds = CellThresholdConfig::Fixed(CellThresholds::new(5.0, 1.0, 60.0));
        config.min_cells = 0;
        let pipeline = Pipeline::new(config).unwrap();

        let ds = pipeline.qc(&small_dataset()).unwrap();
        let cells = pipeline.filter_cells(&ds).unwrap();
        assert_eq!(cells.cells_before, 5);
        // cell 4 is empty, cells 1..=3 have 2 features and 10 counts
        assert_eq!(cells.cells_after, 4);
        let genes = pipeline.filter_genes(&cells.dataset).unwrap();
        assert_eq!(genes.genes_after, 4);
        let normalized = pipeline.normalize(&genes.dataset).unwrap();
        assert!(normalized.normalized().is_some());
        let scored = pipeline.cell_cycle(&normalized).unwrap();
        let cc = scored.cells().cell_cycle.as_ref().unwrap();
        // no signature gene is present
        assert!(cc.phase.iter().all(|&p| p == Phase::G1));

        assert!(matches!(
            pipeline.cluster(&scored),
            Err(ScqcError::StageOrder { .. })
        ));
    }

    #[test]
    fn custom_signature_files() {
        let tmp = tempfile::tempdir().unwrap();
        let s_path = tmp.path().join("s.txt");
        std::fs::write(&s_path, "ACTB\n").unwrap();
        let mut config = PipelineConfig::default();
        config.cell_cycle.s_genes = Some(s_path);
        let pipeline = Pipeline::new(config).unwrap();
        let scorer = pipeline.cell_cycle_scorer().unwrap();

        let mut ds = small_dataset();
        let sf = vec![1.0; ds.n_cells()];
        let layer = crate::normalization::log_normalize(ds.counts(), &sf);
        ds = ds.with_normalized(sf, layer).unwrap();
        let scored = scorer.score(&ds).unwrap();
        let cc = scored.cells().cell_cycle.as_ref().unwrap();
        // ACTB count 2 in cell 1
        assert!((cc.s_score[1] - 3f64.ln()).abs() < 1e-12);
        assert_eq!(cc.phase[1], Phase::S);
        assert_eq!(cc.phase[4], Phase::G1);

        let mut config = PipelineConfig::default();
        config.cell_cycle.g2m_genes = Some(tmp.path().join("absent.txt"));
        let pipeline = Pipeline::new(config).unwrap();
        assert!(matches!(
            pipeline.cell_cycle_scorer(),
            Err(ScqcError::MissingInput { .. })
        ));
    }
}
