use crate::error::{Result, ScqcError};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Categorical condition label for every cell.
///
/// Cells are stored as contiguous blocks, one block per source library, in input
/// order: `offsets[i]` is the first cell of `labels[i]`. Filtering preserves cell
/// order, so blocks stay contiguous; a block may become empty but its label is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Conditions {
    labels: Vec<String>,
    offsets: Vec<usize>,
    n_cells: usize,
}

impl Conditions {
    /// Build from labels and the number of cells in each block.
    pub fn from_block_sizes(labels: Vec<String>, sizes: &[usize]) -> Result<Conditions> {
        if labels.len() != sizes.len() {
            return Err(ScqcError::shape(
                "conditions",
                "condition blocks",
                labels.len(),
                sizes.len(),
            ));
        }
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut n_cells = 0;
        for &sz in sizes {
            offsets.push(n_cells);
            n_cells += sz;
        }
        Ok(Conditions {
            labels,
            offsets,
            n_cells,
        })
    }

    /// Build from one label code per cell. Codes must be non-decreasing.
    pub fn from_codes(labels: Vec<String>, codes: &[u16]) -> Result<Conditions> {
        let mut sizes = vec![0usize; labels.len()];
        let mut last = 0u16;
        for (cell, &code) in codes.iter().enumerate() {
            if code < last || code as usize >= labels.len() {
                return Err(ScqcError::shape(
                    "conditions",
                    format!("condition code of cell {cell}"),
                    format!("{last}..{}", labels.len()),
                    code,
                ));
            }
            last = code;
            sizes[code as usize] += 1;
        }
        Conditions::from_block_sizes(labels, &sizes)
    }

    /// Condition labels in block order
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Total number of cells across all blocks
    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Cell range of block `idx`
    fn block(&self, idx: usize) -> Range<usize> {
        let start = self.offsets[idx];
        let end = self.offsets.get(idx + 1).copied().unwrap_or(self.n_cells);
        start..end
    }

    /// Returns the cell range of `label`, or None if the label doesn't exist.
    pub fn cells_of(&self, label: &str) -> Option<Range<usize>> {
        self.labels.iter().position(|x| x == label).map(|idx| self.block(idx))
    }

    /// Number of cells in each block
    pub fn block_sizes(&self) -> Vec<usize> {
        (0..self.labels.len()).map(|i| self.block(i).len()).collect()
    }

    /// Label code of `cell`
    pub fn code(&self, cell: usize) -> u16 {
        // offsets are sorted; the last block starting at or before `cell` owns it,
        // which also skips empty blocks sharing that offset
        let idx = self.offsets.partition_point(|&o| o <= cell);
        idx.saturating_sub(1) as u16
    }

    /// Label of `cell`
    pub fn label(&self, cell: usize) -> &str {
        &self.labels[self.code(cell) as usize]
    }

    /// One label code per cell
    pub fn codes(&self) -> Vec<u16> {
        let mut codes = Vec::with_capacity(self.n_cells);
        for idx in 0..self.labels.len() {
            codes.extend(self.block(idx).map(|_| idx as u16));
        }
        codes
    }

    /// Keep only the cells at `keep` (sorted, unique), recomputing block offsets.
    pub fn select(&self, keep: &[usize]) -> Conditions {
        let mut sizes = vec![0usize; self.labels.len()];
        for &cell in keep {
            sizes[self.code(cell) as usize] += 1;
        }
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut n_cells = 0;
        for sz in sizes {
            offsets.push(n_cells);
            n_cells += sz;
        }
        Conditions {
            labels: self.labels.clone(),
            offsets,
            n_cells,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(xs: &[&str]) -> Vec<String> {
        xs.iter().map(std::string::ToString::to_string).collect()
    }

    #[test]
    fn test_blocks() {
        let c = Conditions::from_block_sizes(labels(&["fresh", "cryo", "meoh"]), &[3, 0, 2]).unwrap();
        assert_eq!(c.n_cells(), 5);
        assert_eq!(c.cells_of("fresh"), Some(0..3));
        assert_eq!(c.cells_of("cryo"), Some(3..3));
        assert_eq!(c.cells_of("meoh"), Some(3..5));
        assert_eq!(c.cells_of("other"), None);
        assert_eq!(c.codes(), vec![0, 0, 0, 2, 2]);
        assert_eq!(c.label(3), "meoh");
        assert_eq!(c.label(2), "fresh");
    }

    #[test]
    fn test_select() {
        let c = Conditions::from_block_sizes(labels(&["a", "b", "c"]), &[2, 3, 2]).unwrap();
        let s = c.select(&[1, 5, 6]);
        assert_eq!(s.block_sizes(), vec![1, 0, 2]);
        assert_eq!(s.codes(), vec![0, 2, 2]);
        assert_eq!(s.labels(), c.labels());
    }

    #[test]
    fn test_from_codes() {
        let c = Conditions::from_codes(labels(&["a", "b"]), &[0, 0, 1]).unwrap();
        assert_eq!(c.block_sizes(), vec![2, 1]);
        assert!(Conditions::from_codes(labels(&["a", "b"]), &[1, 0]).is_err());
        assert!(Conditions::from_codes(labels(&["a"]), &[0, 1]).is_err());
    }
}
