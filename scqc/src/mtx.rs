use flate2::bufread::MultiGzDecoder;
use scqc_types::{CountMatrix, Result, ScqcError};
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const STAGE: &str = "load";

/// Feature type assigned when the feature table has no third column
pub const DEFAULT_FEATURE_TYPE: &str = "Gene Expression";

/// Feature table columns
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureTable {
    /// first column
    pub ids: Vec<String>,
    /// second column
    pub names: Vec<String>,
    /// third column, or [`DEFAULT_FEATURE_TYPE`]
    pub types: Vec<String>,
}

fn malformed(path: &Path, reason: impl Into<String>) -> ScqcError {
    ScqcError::MalformedInput {
        stage: STAGE,
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Open a text file, transparently decompressing it if the name ends in `.gz`
fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = BufReader::new(File::open(path).map_err(|e| ScqcError::io(STAGE, path, e))?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Call `f` with each line of `path` (without the trailing newline) and its 1-based number.
fn for_each_line(path: &Path, mut f: impl FnMut(usize, &str) -> Result<()>) -> Result<()> {
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut lineno = 0;
    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .map_err(|e| ScqcError::io(STAGE, path, e))?;
        if sz == 0 {
            break;
        }
        lineno += 1;
        f(lineno, line.trim_end_matches(['\n', '\r']))?;
    }
    Ok(())
}

/// Locate `<dir>/<stem>` or `<dir>/<stem>.gz`, trying each stem in turn.
pub fn find_input(dir: &Path, stems: &[&str]) -> Result<PathBuf> {
    for stem in stems {
        for name in [stem.to_string(), format!("{stem}.gz")] {
            let path = dir.join(name);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    Err(ScqcError::MissingInput {
        stage: STAGE,
        path: dir.join(stems.first().copied().unwrap_or_default()),
    })
}

/// Load a genes x cells count matrix from (optionally gzipped) Matrix Market coordinate format
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CountMatrix> {
    let path = path.as_ref();
    let mut mat: Option<TriMat<u32>> = None;
    let mut declared_nnz = 0;
    let mut seen = 0;

    for_each_line(path, |lineno, line| {
        if line.starts_with('%') || line.trim().is_empty() {
            return Ok(());
        }
        let mut data = line.split_whitespace();
        let mut field = |what: &str| {
            data.next()
                .ok_or_else(|| malformed(path, format!("line {lineno}: missing {what}")))
                .and_then(|s| {
                    s.parse::<usize>()
                        .map_err(|e| malformed(path, format!("line {lineno}: bad {what} {s:?}: {e}")))
                })
        };
        match mat.as_mut() {
            None => {
                let nrow = field("NROW")?;
                let ncol = field("NCOL")?;
                declared_nnz = field("NNZ")?;
                mat = Some(TriMat::with_capacity((nrow, ncol), declared_nnz));
            }
            Some(m) => {
                let row = field("ROW")?;
                let col = field("COL")?;
                let val = field("VAL")?;
                if row == 0 || row > m.rows() || col == 0 || col > m.cols() {
                    return Err(malformed(
                        path,
                        format!("line {lineno}: entry ({row}, {col}) outside {} x {}", m.rows(), m.cols()),
                    ));
                }
                let val = u32::try_from(val)
                    .map_err(|_| malformed(path, format!("line {lineno}: count {val} too large")))?;
                m.add_triplet(row - 1, col - 1, val);
                seen += 1;
            }
        }
        Ok(())
    })?;

    let Some(matrix) = mat else {
        return Err(malformed(path, "no matrix header found"));
    };
    if seen != declared_nnz {
        return Err(malformed(
            path,
            format!("header declares {declared_nnz} entries, found {seen}"),
        ));
    }
    Ok(matrix.to_csc())
}

/// Load one barcode per line (first tab-separated column)
pub fn load_barcodes(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut barcodes = Vec::new();
    for_each_line(path, |_, line| {
        if let Some(bc) = line.split('\t').next().filter(|s| !s.is_empty()) {
            barcodes.push(bc.to_string());
        }
        Ok(())
    })?;
    Ok(barcodes)
}

/// Load a list of names, one per line. Blank lines and `#` comments are skipped.
pub fn load_name_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for_each_line(path.as_ref(), |_, line| {
        let name = line.trim();
        if !name.is_empty() && !name.starts_with('#') {
            names.push(name.to_string());
        }
        Ok(())
    })?;
    Ok(names)
}

/// Load a tab-separated feature table with at least (gene_id, gene_name) columns
pub fn load_features(path: impl AsRef<Path>) -> Result<FeatureTable> {
    let path = path.as_ref();
    let mut table = FeatureTable::default();
    for_each_line(path, |lineno, line| {
        if line.is_empty() {
            return Ok(());
        }
        let mut cols = line.split('\t');
        let (Some(id), Some(name)) = (cols.next(), cols.next()) else {
            return Err(malformed(path, format!("line {lineno}: expected gene_id<TAB>gene_name")));
        };
        table.ids.push(id.to_string());
        table.names.push(name.to_string());
        table
            .types
            .push(cols.next().unwrap_or(DEFAULT_FEATURE_TYPE).to_string());
        Ok(())
    })?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n%\n3 2 3\n1 1 5\n3 1 1\n2 2 7\n";

    #[test]
    fn test_load_mtx_plain_and_gz() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("matrix.mtx");
        std::fs::write(&plain, MTX).unwrap();
        let gz = dir.path().join("matrix.mtx.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(MTX.as_bytes()).unwrap();
        enc.finish().unwrap();

        for path in [plain, gz] {
            let m = load_mtx(&path).unwrap();
            assert_eq!(m.shape(), (3, 2));
            assert!(m.is_csc());
            assert_eq!(m.get(0, 0), Some(&5));
            assert_eq!(m.get(2, 0), Some(&1));
            assert_eq!(m.get(1, 1), Some(&7));
            assert_eq!(m.nnz(), 3);
        }
    }

    #[test]
    fn test_bad_mtx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx");
        std::fs::write(&path, "3 2 2\n1 1 5\n").unwrap();
        assert!(matches!(load_mtx(&path), Err(ScqcError::MalformedInput { .. })));
        std::fs::write(&path, "3 2 1\n4 1 5\n").unwrap();
        assert!(matches!(load_mtx(&path), Err(ScqcError::MalformedInput { .. })));
        assert!(matches!(
            load_mtx(dir.path().join("absent.mtx")),
            Err(ScqcError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_features_and_barcodes() {
        let dir = tempfile::tempdir().unwrap();
        let features = dir.path().join("features.tsv");
        std::fs::write(&features, "ENSG1\tMT-CO1\tGene Expression\nENSG2\tACTB\n").unwrap();
        let table = load_features(&features).unwrap();
        assert_eq!(table.names, vec!["MT-CO1", "ACTB"]);
        assert_eq!(table.types, vec![DEFAULT_FEATURE_TYPE; 2]);

        std::fs::write(&features, "ENSG1\n").unwrap();
        assert!(load_features(&features).is_err());

        let barcodes = dir.path().join("barcodes.tsv");
        std::fs::write(&barcodes, "AAAC-1\nAAAG-1\n\n").unwrap();
        assert_eq!(load_barcodes(&barcodes).unwrap(), vec!["AAAC-1", "AAAG-1"]);

        assert_eq!(find_input(dir.path(), &["features.tsv", "genes.tsv"]).unwrap(), features);
        assert!(matches!(
            find_input(dir.path(), &["matrix.mtx"]),
            Err(ScqcError::MissingInput { .. })
        ));
    }
}
