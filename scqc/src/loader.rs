//! Merge per-condition count matrices into one annotated [`Dataset`].

use crate::mtx::{find_input, load_barcodes, load_features, load_mtx};
use log::{info, warn};
use scqc_types::sparse::CountMatrix;
use scqc_types::{CellMetadata, Conditions, Dataset, GeneMetadata, Result, ScqcError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const STAGE: &str = "load";

/// Candidate file names inside a condition directory
const MATRIX_FILES: &[&str] = &["matrix.mtx"];
const BARCODE_FILES: &[&str] = &["barcodes.tsv"];
const FEATURE_FILES: &[&str] = &["features.tsv", "genes.tsv"];

/// One source library: a condition label and the directory holding its matrix
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionInput {
    /// condition label attached to every cell of this library
    pub condition: String,
    /// directory holding matrix, barcode and feature files
    pub dir: PathBuf,
}

impl ConditionInput {
    /// Pair a condition label with its directory
    pub fn new(condition: impl Into<String>, dir: impl Into<PathBuf>) -> ConditionInput {
        ConditionInput {
            condition: condition.into(),
            dir: dir.into(),
        }
    }
}

/// Reads several condition directories and concatenates their cells.
///
/// The gene table of the first condition is canonical; every other condition must
/// list the same gene ids in the same order.
#[derive(Clone, Debug, Default)]
pub struct MatrixLoader {
    inputs: Vec<ConditionInput>,
}

struct Library {
    counts: CountMatrix,
    barcodes: Vec<String>,
}

impl MatrixLoader {
    /// Loader over `inputs`, in order
    pub fn new(inputs: Vec<ConditionInput>) -> MatrixLoader {
        MatrixLoader { inputs }
    }

    /// Add a condition
    pub fn with_condition(mut self, condition: impl Into<String>, dir: impl Into<PathBuf>) -> MatrixLoader {
        self.inputs.push(ConditionInput::new(condition, dir));
        self
    }

    /// Load and merge every condition
    pub fn load(&self) -> Result<Dataset> {
        let Some(first) = self.inputs.first() else {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "conditions",
                reason: "at least one condition directory is required".to_string(),
            });
        };
        let mut seen_labels = HashSet::new();
        for input in &self.inputs {
            if !seen_labels.insert(input.condition.as_str()) {
                return Err(ScqcError::InvalidParameter {
                    stage: STAGE,
                    name: "conditions",
                    reason: format!("condition {} listed twice", input.condition),
                });
            }
            if !input.dir.is_dir() {
                return Err(ScqcError::MissingInput {
                    stage: STAGE,
                    path: input.dir.clone(),
                });
            }
        }

        let features = load_features(find_input(&first.dir, FEATURE_FILES)?)?;
        let genes = GeneMetadata::new(features.ids, features.names, features.types);

        let mut libraries = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            libraries.push(load_library(input, &genes)?);
        }

        let sizes: Vec<usize> = libraries.iter().map(|l| l.barcodes.len()).collect();
        let labels = self.inputs.iter().map(|i| i.condition.clone()).collect();
        let conditions = Conditions::from_block_sizes(labels, &sizes)?;

        let mut barcodes = Vec::with_capacity(conditions.n_cells());
        let mut cell_ids = Vec::with_capacity(conditions.n_cells());
        let mut taken = HashSet::with_capacity(conditions.n_cells());
        for (input, lib) in self.inputs.iter().zip(&libraries) {
            for bc in &lib.barcodes {
                cell_ids.push(unique_cell_id(bc, &input.condition, &mut taken));
                barcodes.push(bc.clone());
            }
        }

        let counts = hstack(genes.len(), libraries.iter().map(|l| &l.counts));
        let cells = CellMetadata::new(cell_ids, barcodes, conditions);
        let ds = Dataset::new(counts, cells, genes)?;
        info!(
            "loaded {} cells x {} genes from {} conditions",
            ds.n_cells(),
            ds.n_genes(),
            self.inputs.len()
        );
        Ok(ds)
    }
}

fn load_library(input: &ConditionInput, genes: &GeneMetadata) -> Result<Library> {
    let dir = &input.dir;
    let features_path = find_input(dir, FEATURE_FILES)?;
    let features = load_features(&features_path)?;
    check_gene_order(&features_path, &features.ids, &genes.gene_ids)?;

    let barcodes_path = find_input(dir, BARCODE_FILES)?;
    let barcodes = load_barcodes(&barcodes_path)?;
    let matrix_path = find_input(dir, MATRIX_FILES)?;
    let counts = load_mtx(&matrix_path)?;

    if counts.rows() != genes.len() {
        return Err(ScqcError::shape(
            STAGE,
            format!("rows of {}", matrix_path.display()),
            genes.len(),
            counts.rows(),
        ));
    }
    if counts.cols() != barcodes.len() {
        return Err(ScqcError::shape(
            STAGE,
            format!("columns of {} vs {}", matrix_path.display(), barcodes_path.display()),
            barcodes.len(),
            counts.cols(),
        ));
    }
    if barcodes.is_empty() {
        warn!("condition {} has no cells", input.condition);
    }
    info!(
        "condition {}: {} cells, {} non-zero entries",
        input.condition,
        barcodes.len(),
        counts.nnz()
    );
    Ok(Library { counts, barcodes })
}

fn check_gene_order(path: &Path, ids: &[String], canonical: &[String]) -> Result<()> {
    if ids.len() != canonical.len() {
        return Err(ScqcError::shape(
            STAGE,
            format!("gene count of {}", path.display()),
            canonical.len(),
            ids.len(),
        ));
    }
    if let Some(row) = ids.iter().zip(canonical).position(|(a, b)| a != b) {
        return Err(ScqcError::shape(
            STAGE,
            format!("gene ordering of {} at row {}", path.display(), row + 1),
            &canonical[row],
            &ids[row],
        ));
    }
    Ok(())
}

/// First occurrence keeps the raw barcode; later collisions get the condition as a
/// suffix, then a counter if that is taken too.
fn unique_cell_id(barcode: &str, condition: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(barcode.to_string()) {
        return barcode.to_string();
    }
    let base = format!("{barcode}_{condition}");
    if taken.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let id = format!("{base}_{n}");
        if taken.insert(id.clone()) {
            return id;
        }
        n += 1;
    }
}

/// Concatenate CSC matrices with `rows` rows column-wise
fn hstack<'a>(rows: usize, mats: impl Iterator<Item = &'a CountMatrix>) -> CountMatrix {
    let mut indptr = vec![0];
    let mut indices = Vec::new();
    let mut data = Vec::new();
    for m in mats {
        for col in m.outer_iterator() {
            for (r, &v) in col.iter() {
                indices.push(r);
                data.push(v);
            }
            indptr.push(indices.len());
        }
    }
    let cols = indptr.len() - 1;
    CountMatrix::new_csc((rows, cols), indptr, indices, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_condition(dir: &Path, genes: &[&str], barcodes: &[&str], entries: &[(usize, usize, u32)]) {
        std::fs::create_dir_all(dir).unwrap();
        let features: String = genes.iter().map(|g| format!("ID_{g}\t{g}\n")).collect();
        std::fs::write(dir.join("features.tsv"), features).unwrap();
        let bcs: String = barcodes.iter().map(|b| format!("{b}\n")).collect();
        std::fs::write(dir.join("barcodes.tsv"), bcs).unwrap();
        let mut mtx = format!(
            "%%MatrixMarket matrix coordinate integer general\n{} {} {}\n",
            genes.len(),
            barcodes.len(),
            entries.len()
        );
        for (r, c, v) in entries {
            mtx.push_str(&format!("{} {} {}\n", r + 1, c + 1, v));
        }
        std::fs::write(dir.join("matrix.mtx"), mtx).unwrap();
    }

    #[test]
    fn merges_conditions_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let genes = ["MT-CO1", "ACTB", "CD3E"];
        write_condition(&tmp.path().join("fresh"), &genes, &["A", "B"], &[(0, 0, 3), (1, 1, 4)]);
        write_condition(&tmp.path().join("cryo"), &genes, &["B", "C", "D"], &[(2, 0, 1), (1, 2, 9)]);

        let ds = MatrixLoader::default()
            .with_condition("fresh", tmp.path().join("fresh"))
            .with_condition("cryo", tmp.path().join("cryo"))
            .load()
            .unwrap();

        assert_eq!(ds.n_cells(), 5);
        assert_eq!(ds.n_genes(), 3);
        assert_eq!(ds.cells().cell_ids, vec!["A", "B", "B_cryo", "C", "D"]);
        assert_eq!(ds.cells().barcodes, vec!["A", "B", "B", "C", "D"]);
        assert_eq!(ds.cells().conditions.block_sizes(), vec![2, 3]);
        assert_eq!(ds.counts().get(2, 2), Some(&1));
        assert_eq!(ds.counts().get(1, 4), Some(&9));
    }

    #[test]
    fn gene_order_must_match() {
        let tmp = tempfile::tempdir().unwrap();
        write_condition(&tmp.path().join("a"), &["X", "Y"], &["A"], &[(0, 0, 1)]);
        write_condition(&tmp.path().join("b"), &["Y", "X"], &["A"], &[(0, 0, 1)]);
        let err = MatrixLoader::default()
            .with_condition("a", tmp.path().join("a"))
            .with_condition("b", tmp.path().join("b"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ScqcError::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn missing_files_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        write_condition(&tmp.path().join("a"), &["X"], &["A"], &[(0, 0, 1)]);
        std::fs::remove_file(tmp.path().join("a/matrix.mtx")).unwrap();
        let err = MatrixLoader::default()
            .with_condition("a", tmp.path().join("a"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ScqcError::MissingInput { .. }));

        let err = MatrixLoader::default()
            .with_condition("a", tmp.path().join("nope"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ScqcError::MissingInput { .. }));
    }

    #[test]
    fn unique_ids() {
        let mut taken = HashSet::new();
        assert_eq!(unique_cell_id("A", "x", &mut taken), "A");
        assert_eq!(unique_cell_id("A", "x", &mut taken), "A_x");
        assert_eq!(unique_cell_id("A", "x", &mut taken), "A_x_2");
        assert_eq!(unique_cell_id("A", "y", &mut taken), "A_y");
    }
}
