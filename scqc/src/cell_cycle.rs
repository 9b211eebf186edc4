//! Cell-cycle phase scoring against S-phase and G2/M gene signatures.

use crate::mtx::load_name_list;
use log::{info, warn};
use scqc_types::{CellCycle, Dataset, Phase, Result, ScqcError};
use std::collections::HashMap;
use std::path::Path;

const STAGE: &str = "cell-cycle";

/// Scores below this value on both signatures mean G1
pub const DEFAULT_PHASE_BASELINE: f64 = 0.05;

/// S-phase signature (Tirosh et al. 2016)
pub const S_PHASE_GENES: &[&str] = &[
    "MCM5", "PCNA", "TYMS", "FEN1", "MCM2", "MCM4", "RRM1", "UNG", "GINS2", "MCM6", "CDCA7", "DTL", "PRIM1",
    "UHRF1", "MLF1IP", "HELLS", "RFC2", "RPA2", "NASP", "RAD51AP1", "GMNN", "WDR76", "SLBP", "CCNE2", "UBR7",
    "POLD3", "MSH2", "ATAD2", "RAD51", "RRM2", "CDC45", "CDC6", "EXO1", "TIPIN", "DSCC1", "BLM", "CASP8AP2",
    "USP1", "CLSPN", "POLA1", "CHAF1B", "BRIP1", "E2F8",
];

/// G2/M signature (Tirosh et al. 2016)
pub const G2M_PHASE_GENES: &[&str] = &[
    "HMGB2", "CDK1", "NUSAP1", "UBE2C", "BIRC5", "TPX2", "TOP2A", "NDC80", "CKS2", "NUF2", "CKS1B", "MKI67",
    "TMPO", "CENPF", "TACC3", "FAM64A", "SMC4", "CCNB2", "CKAP2L", "CKAP2", "AURKB", "BUB1", "KIF11", "ANP32E",
    "TUBB4B", "GTSE1", "KIF20B", "HJURP", "CDCA3", "HN1", "CDC20", "TTK", "CDC25C", "KIF2C", "RANGAP1", "NCAPD2",
    "DLGAP5", "CDCA2", "CDCA8", "ECT2", "KIF23", "HMMR", "AURKA", "PSRC1", "ANLN", "LBR", "CKAP5", "CENPE",
    "CTCF", "NEK2", "G2E3", "GAS2L3", "CBX5", "CENPA",
];

/// Load a signature from a file with one gene name per line
pub fn load_gene_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let genes = load_name_list(path.as_ref())?;
    if genes.is_empty() {
        return Err(ScqcError::MalformedInput {
            stage: STAGE,
            path: path.as_ref().to_path_buf(),
            reason: "gene list is empty".to_string(),
        });
    }
    Ok(genes)
}

/// Phase rule: G1 when both scores are under `baseline`, otherwise the larger
/// signature, ties going to S.
pub fn assign_phase(s_score: f64, g2m_score: f64, baseline: f64) -> Phase {
    if s_score < baseline && g2m_score < baseline {
        Phase::G1
    } else if s_score >= g2m_score {
        Phase::S
    } else {
        Phase::G2M
    }
}

/// Scores each cell as the mean normalized expression of each signature and assigns a phase.
///
/// Signature genes are matched to gene names ignoring ASCII case. Genes missing from the
/// dataset are skipped; a signature with no gene present scores 0 in every cell.
#[derive(Clone, Debug)]
pub struct CellCycleScorer {
    s_genes: Vec<String>,
    g2m_genes: Vec<String>,
    baseline: f64,
}

impl Default for CellCycleScorer {
    fn default() -> Self {
        CellCycleScorer::new(
            S_PHASE_GENES.iter().map(|g| g.to_string()).collect(),
            G2M_PHASE_GENES.iter().map(|g| g.to_string()).collect(),
        )
    }
}

impl CellCycleScorer {
    /// Scorer over custom signatures, with the default baseline
    pub fn new(s_genes: Vec<String>, g2m_genes: Vec<String>) -> CellCycleScorer {
        CellCycleScorer {
            s_genes,
            g2m_genes,
            baseline: DEFAULT_PHASE_BASELINE,
        }
    }

    /// Set the G1 baseline
    pub fn with_baseline(mut self, baseline: f64) -> CellCycleScorer {
        self.baseline = baseline;
        self
    }

    /// Row indices of `signature` genes present in `ds`
    fn present_rows(ds: &Dataset, signature: &[String], label: &str) -> Vec<usize> {
        let by_name: HashMap<String, usize> = ds
            .genes()
            .gene_names
            .iter()
            .enumerate()
            .rev()
            .map(|(i, n)| (n.to_ascii_uppercase(), i))
            .collect();
        let mut rows: Vec<usize> = signature
            .iter()
            .filter_map(|g| by_name.get(&g.to_ascii_uppercase()).copied())
            .collect();
        rows.sort_unstable();
        rows.dedup();
        if rows.is_empty() {
            warn!("no {label} signature gene is present; {label} scores are 0");
        } else if rows.len() < signature.len() {
            warn!(
                "{} of {} {label} signature genes are absent and skipped",
                signature.len() - rows.len(),
                signature.len()
            );
        }
        rows
    }

    /// Return a copy of `ds` annotated with S and G2M scores and a phase per cell
    pub fn score(&self, ds: &Dataset) -> Result<Dataset> {
        let Some(layer) = ds.normalized() else {
            return Err(ScqcError::StageOrder {
                stage: STAGE,
                reason: "cell-cycle scoring needs a normalized layer".to_string(),
            });
        };
        if !self.baseline.is_finite() {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "baseline",
                reason: format!("{} is not finite", self.baseline),
            });
        }

        let s_rows = Self::present_rows(ds, &self.s_genes, "S");
        let g2m_rows = Self::present_rows(ds, &self.g2m_genes, "G2M");
        let mut in_s = vec![false; ds.n_genes()];
        let mut in_g2m = vec![false; ds.n_genes()];
        s_rows.iter().for_each(|&r| in_s[r] = true);
        g2m_rows.iter().for_each(|&r| in_g2m[r] = true);

        let mut cc = CellCycle::default();
        for col in layer.outer_iterator() {
            let (mut s, mut g2m) = (0.0, 0.0);
            for (g, &v) in col.iter() {
                if in_s[g] {
                    s += v;
                }
                if in_g2m[g] {
                    g2m += v;
                }
            }
            let s = if s_rows.is_empty() { 0.0 } else { s / s_rows.len() as f64 };
            let g2m = if g2m_rows.is_empty() { 0.0 } else { g2m / g2m_rows.len() as f64 };
            cc.s_score.push(s);
            cc.g2m_score.push(g2m);
            cc.phase.push(assign_phase(s, g2m, self.baseline));
        }

        let count = |p: Phase| cc.phase.iter().filter(|&&x| x == p).count();
        info!(
            "cell-cycle phases: G1 {}, S {}, G2M {} ({} S genes, {} G2M genes used)",
            count(Phase::G1),
            count(Phase::S),
            count(Phase::G2M),
            s_rows.len(),
            g2m_rows.len()
        );

        let mut cells = ds.cells().clone();
        cells.cell_cycle = Some(cc);
        ds.clone().with_cells(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scqc_types::{CellMetadata, Conditions, ExprMatrix, GeneMetadata};
    use sprs::TriMat;

    /// genes: MCM5, PCNA (S), TOP2A (G2M), ACTB; one cell per column of `values`
    fn scored_dataset(values: &[[f64; 4]]) -> Dataset {
        let names = ["MCM5", "PCNA", "TOP2A", "ACTB"];
        let n = values.len();
        let mut counts = TriMat::new((4, n));
        let mut layer = TriMat::new((4, n));
        for (c, col) in values.iter().enumerate() {
            counts.add_triplet(3, c, 1u32);
            for (g, &v) in col.iter().enumerate() {
                if v != 0.0 {
                    layer.add_triplet(g, c, v);
                }
            }
        }
        let ids: Vec<String> = (0..n).map(|i| format!("c{i}")).collect();
        let cells = CellMetadata::new(
            ids.clone(),
            ids,
            Conditions::from_block_sizes(vec!["fresh".into()], &[n]).unwrap(),
        );
        let genes = GeneMetadata::new(
            names.iter().map(|s| format!("ID_{s}")).collect(),
            names.iter().map(|s| s.to_string()).collect(),
            vec!["Gene Expression".into(); 4],
        );
        let layer: ExprMatrix = layer.to_csc();
        Dataset::new(counts.to_csc(), cells, genes)
            .unwrap()
            .with_normalized(vec![1.0; n], layer)
            .unwrap()
    }

    #[test]
    fn scores_are_signature_means() {
        let ds = scored_dataset(&[
            [0.6, 1.0, 0.3, 2.0],
            [0.0, 0.0, 0.0, 5.0],
            [0.2, 0.2, 0.9, 0.0],
            [0.5, 0.5, 0.5, 0.0],
        ]);
        let out = CellCycleScorer::default().score(&ds).unwrap();
        let cc = out.cells().cell_cycle.as_ref().unwrap();
        assert!((cc.s_score[0] - 0.8).abs() < 1e-12);
        assert!((cc.g2m_score[0] - 0.3).abs() < 1e-12);
        assert_eq!(cc.phase, vec![Phase::S, Phase::G1, Phase::G2M, Phase::S]);
        assert!(ds.cells().cell_cycle.is_none());
    }

    #[test]
    fn absent_signature_scores_zero() {
        let ds = scored_dataset(&[[1.0, 1.0, 1.0, 1.0]]);
        let scorer = CellCycleScorer::new(vec!["pcna".into(), "NOPE".into()], vec!["MISSING".into()]);
        let out = scorer.score(&ds).unwrap();
        let cc = out.cells().cell_cycle.as_ref().unwrap();
        assert_eq!(cc.s_score, vec![1.0]);
        assert_eq!(cc.g2m_score, vec![0.0]);
        assert_eq!(cc.phase, vec![Phase::S]);
    }

    #[test]
    fn needs_normalized_layer() {
        let ds = scored_dataset(&[[1.0, 1.0, 1.0, 1.0]]);
        let raw = Dataset::new(ds.counts().clone(), ds.cells().clone(), ds.genes().clone()).unwrap();
        assert!(matches!(
            CellCycleScorer::default().score(&raw),
            Err(ScqcError::StageOrder { .. })
        ));
    }

    #[test]
    fn phase_rule() {
        assert_eq!(assign_phase(0.01, 0.02, DEFAULT_PHASE_BASELINE), Phase::G1);
        assert_eq!(assign_phase(0.4, 0.4, DEFAULT_PHASE_BASELINE), Phase::S);
        assert_eq!(assign_phase(0.01, 0.4, DEFAULT_PHASE_BASELINE), Phase::G2M);
    }

    #[test]
    fn gene_list_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.txt");
        std::fs::write(&path, "# S genes\nMCM5\n\nPCNA\n").unwrap();
        assert_eq!(load_gene_list(&path).unwrap(), vec!["MCM5", "PCNA"]);
        std::fs::write(&path, "\n").unwrap();
        assert!(load_gene_list(&path).is_err());
    }
}
