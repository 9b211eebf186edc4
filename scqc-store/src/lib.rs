//! Persist a [`Dataset`] as a single versioned artifact: gzipped JSON holding the count
//! and normalized matrices as column-major triples, both metadata tables, size factors,
//! embeddings and cluster labels.

#![deny(missing_docs)]

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::Array2;
use scqc_types::sparse::{csc_triplets, from_csc_triplets};
use scqc_types::{
    CellCycle, CellMetadata, CellQc, Conditions, Dataset, DatasetParts, GeneMetadata, Phase, Result, ScqcError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const STAGE: &str = "store";

/// Artifact layout version written by this crate
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Triples<N> {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<N>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct QcColumns {
    total_counts: Vec<u64>,
    detected_feature_count: Vec<u32>,
    pct_flagged_subset: Vec<f64>,
    degenerate: Vec<bool>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CellCycleColumns {
    s_score: Vec<f64>,
    g2m_score: Vec<f64>,
    phase: Vec<Phase>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CellTable {
    cell_ids: Vec<String>,
    barcodes: Vec<String>,
    condition_labels: Vec<String>,
    condition_codes: Vec<u16>,
    is_filtered_out: Vec<bool>,
    qc: Option<QcColumns>,
    cell_cycle: Option<CellCycleColumns>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneTable {
    gene_ids: Vec<String>,
    gene_names: Vec<String>,
    feature_types: Vec<String>,
    flagged_subset: Option<String>,
    is_flagged_subset: Vec<bool>,
    n_expressing_cells: Option<Vec<u32>>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DenseTable {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Artifact {
    schema_version: u32,
    n_cells: usize,
    n_genes: usize,
    counts: Triples<u32>,
    cells: CellTable,
    genes: GeneTable,
    size_factors: Option<Vec<f64>>,
    normalized: Option<Triples<f64>>,
    embeddings: BTreeMap<String, DenseTable>,
    clusters: Option<Vec<u32>>,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ScqcError {
    ScqcError::CorruptArtifact {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn triples<N: Clone + Default>(m: &sprs::CsMat<N>) -> Triples<N> {
    let (rows, cols, values) = csc_triplets(m);
    Triples { rows, cols, values }
}

impl Artifact {
    fn from_dataset(ds: &Dataset) -> Artifact {
        let cells = ds.cells();
        let genes = ds.genes();
        Artifact {
            schema_version: SCHEMA_VERSION,
            n_cells: ds.n_cells(),
            n_genes: ds.n_genes(),
            counts: triples(ds.counts()),
            cells: CellTable {
                cell_ids: cells.cell_ids.clone(),
                barcodes: cells.barcodes.clone(),
                condition_labels: cells.conditions.labels().to_vec(),
                condition_codes: cells.conditions.codes(),
                is_filtered_out: cells.is_filtered_out.clone(),
                qc: cells.qc.as_ref().map(|qc| QcColumns {
                    total_counts: qc.total_counts.clone(),
                    detected_feature_count: qc.detected_features.clone(),
                    pct_flagged_subset: qc.pct_flagged.clone(),
                    degenerate: qc.degenerate.clone(),
                }),
                cell_cycle: cells.cell_cycle.as_ref().map(|cc| CellCycleColumns {
                    s_score: cc.s_score.clone(),
                    g2m_score: cc.g2m_score.clone(),
                    phase: cc.phase.clone(),
                }),
            },
            genes: GeneTable {
                gene_ids: genes.gene_ids.clone(),
                gene_names: genes.gene_names.clone(),
                feature_types: genes.feature_types.clone(),
                flagged_subset: genes.flagged_subset.clone(),
                is_flagged_subset: genes.is_flagged.clone(),
                n_expressing_cells: genes.n_expressing_cells.clone(),
            },
            size_factors: ds.size_factors().map(|sf| sf.to_vec()),
            normalized: ds.normalized().map(triples),
            embeddings: ds
                .embeddings()
                .iter()
                .map(|(name, coords)| {
                    (
                        name.clone(),
                        DenseTable {
                            rows: coords.nrows(),
                            cols: coords.ncols(),
                            values: coords.iter().copied().collect(),
                        },
                    )
                })
                .collect(),
            clusters: ds.clusters().map(|c| c.to_vec()),
        }
    }

    fn into_dataset(self, path: &Path) -> Result<Dataset> {
        if self.n_cells != self.cells.cell_ids.len() {
            return Err(corrupt(
                path,
                format!("header says {} cells, cell table has {}", self.n_cells, self.cells.cell_ids.len()),
            ));
        }
        if self.n_genes != self.genes.gene_ids.len() {
            return Err(corrupt(
                path,
                format!("header says {} genes, gene table has {}", self.n_genes, self.genes.gene_ids.len()),
            ));
        }
        let shape = (self.n_genes, self.n_cells);
        let counts = from_csc_triplets(shape, self.counts.rows, self.counts.cols, self.counts.values)
            .map_err(|e| corrupt(path, format!("counts: {e}")))?;
        let normalized = match self.normalized {
            Some(t) => Some(
                from_csc_triplets(shape, t.rows, t.cols, t.values)
                    .map_err(|e| corrupt(path, format!("normalized layer: {e}")))?,
            ),
            None => None,
        };

        let c = self.cells;
        let conditions = Conditions::from_codes(c.condition_labels, &c.condition_codes)
            .map_err(|e| corrupt(path, format!("conditions: {e}")))?;
        if conditions.n_cells() != c.cell_ids.len() {
            return Err(corrupt(
                path,
                format!(
                    "{} condition codes for {} cells",
                    conditions.n_cells(),
                    c.cell_ids.len()
                ),
            ));
        }
        let cells = CellMetadata {
            cell_ids: c.cell_ids,
            barcodes: c.barcodes,
            conditions,
            is_filtered_out: c.is_filtered_out,
            qc: c.qc.map(|qc| CellQc {
                total_counts: qc.total_counts,
                detected_features: qc.detected_feature_count,
                pct_flagged: qc.pct_flagged_subset,
                degenerate: qc.degenerate,
            }),
            cell_cycle: c.cell_cycle.map(|cc| CellCycle {
                s_score: cc.s_score,
                g2m_score: cc.g2m_score,
                phase: cc.phase,
            }),
        };

        let g = self.genes;
        let genes = GeneMetadata {
            gene_ids: g.gene_ids,
            gene_names: g.gene_names,
            feature_types: g.feature_types,
            flagged_subset: g.flagged_subset,
            is_flagged: g.is_flagged_subset,
            n_expressing_cells: g.n_expressing_cells,
        };

        let mut embeddings = BTreeMap::new();
        for (name, table) in self.embeddings {
            let coords = Array2::from_shape_vec((table.rows, table.cols), table.values)
                .map_err(|e| corrupt(path, format!("embedding {name}: {e}")))?;
            embeddings.insert(name, coords);
        }

        Dataset::from_parts(DatasetParts {
            counts,
            cells,
            genes,
            size_factors: self.size_factors,
            normalized,
            embeddings,
            clusters: self.clusters,
        })
        .map_err(|e| corrupt(path, e.to_string()))
    }
}

/// Sibling path the artifact is written to before being renamed into place
fn temp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Saves and loads datasets
#[derive(Clone, Copy, Debug, Default)]
pub struct DatasetStore;

impl DatasetStore {
    /// Write `ds` to `path`. The file is replaced as a whole: a failed write leaves any
    /// previous artifact at `path` untouched.
    pub fn save(ds: &Dataset, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let io_err = |e| ScqcError::io(STAGE, path, e);

        let write = || -> std::io::Result<()> {
            let file = BufWriter::new(File::create(&tmp)?);
            let mut encoder = GzEncoder::new(file, Compression::default());
            serde_json::to_writer(&mut encoder, &Artifact::from_dataset(ds))?;
            encoder.finish()?.flush()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;
        info!(
            "saved {} cells x {} genes to {}",
            ds.n_cells(),
            ds.n_genes(),
            path.display()
        );
        Ok(())
    }

    /// Read a dataset written by [`DatasetStore::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Dataset> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ScqcError::io(STAGE, path, e))?;
        let mut bytes = Vec::new();
        GzDecoder::new(BufReader::new(file))
            .read_to_end(&mut bytes)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
                    corrupt(path, format!("not a gzip stream: {e}"))
                }
                _ => ScqcError::io(STAGE, path, e),
            })?;

        let probe: VersionProbe =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(path, format!("no schema version: {e}")))?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(ScqcError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: probe.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        let artifact: Artifact = serde_json::from_slice(&bytes).map_err(|e| corrupt(path, e.to_string()))?;
        let ds = artifact.into_dataset(path)?;
        info!(
            "loaded {} cells x {} genes from {}",
            ds.n_cells(),
            ds.n_genes(),
            path.display()
        );
        Ok(ds)
    }
}
