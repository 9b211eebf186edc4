use sprs::CsMat;

/// Genes x cells UMI counts, compressed by column so each cell is contiguous
pub type CountMatrix = CsMat<u32>;

/// Genes x cells expression values with the sparsity pattern of the counts
pub type ExprMatrix = CsMat<f64>;

/// Keep the columns `cols` of a CSC matrix, in the given order.
pub fn select_cols<N: Clone + Default>(m: &CsMat<N>, cols: &[usize]) -> CsMat<N> {
    let m = if m.is_csc() { m.view() } else { return select_cols(&m.to_csc(), cols) };
    let mut indptr = Vec::with_capacity(cols.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for &c in cols {
        if let Some(col) = m.outer_view(c) {
            for (r, v) in col.iter() {
                indices.push(r);
                data.push(v.clone());
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new_csc((m.rows(), cols.len()), indptr, indices, data)
}

/// Keep the rows `rows` (sorted, unique) of a CSC matrix.
pub fn select_rows<N: Clone + Default>(m: &CsMat<N>, rows: &[usize]) -> CsMat<N> {
    let m = if m.is_csc() { m.view() } else { return select_rows(&m.to_csc(), rows) };
    let mut new_index = vec![usize::MAX; m.rows()];
    for (new, &old) in rows.iter().enumerate() {
        new_index[old] = new;
    }
    let mut indptr = Vec::with_capacity(m.cols() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for col in m.outer_iterator() {
        for (r, v) in col.iter() {
            let new = new_index[r];
            if new != usize::MAX {
                indices.push(new);
                data.push(v.clone());
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new_csc((rows.len(), m.cols()), indptr, indices, data)
}

/// Stored entries of a CSC matrix as `(row, col, value)` triples in column-major order.
pub fn csc_triplets<N: Clone + Default>(m: &CsMat<N>) -> (Vec<usize>, Vec<usize>, Vec<N>) {
    let m = if m.is_csc() { m.clone() } else { m.to_csc() };
    let mut rows = Vec::with_capacity(m.nnz());
    let mut cols = Vec::with_capacity(m.nnz());
    let mut vals = Vec::with_capacity(m.nnz());
    for (c, col) in m.outer_iterator().enumerate() {
        for (r, v) in col.iter() {
            rows.push(r);
            cols.push(c);
            vals.push(v.clone());
        }
    }
    (rows, cols, vals)
}

/// Rebuild a CSC matrix from column-major triples, as produced by [`csc_triplets`].
/// Stored entries (including explicit zeros) are kept exactly. Returns a message on
/// out-of-range or unsorted triples.
pub fn from_csc_triplets<N>(
    shape: (usize, usize),
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<N>,
) -> Result<CsMat<N>, String> {
    let (nrows, ncols) = shape;
    if rows.len() != cols.len() || rows.len() != vals.len() {
        return Err(format!(
            "triple arrays differ in length: {} rows, {} cols, {} values",
            rows.len(),
            cols.len(),
            vals.len()
        ));
    }
    let indptr_len = ncols
        .checked_add(1)
        .ok_or_else(|| format!("column count {ncols} is too large"))?;
    let mut indptr = vec![0usize; indptr_len];
    let mut prev: Option<(usize, usize)> = None;
    for (&r, &c) in rows.iter().zip(cols.iter()) {
        if r >= nrows || c >= ncols {
            return Err(format!("entry ({r}, {c}) outside a {nrows} x {ncols} matrix"));
        }
        if let Some((pr, pc)) = prev {
            if c < pc || (c == pc && r <= pr) {
                return Err(format!("entry ({r}, {c}) is not in column-major order"));
            }
        }
        prev = Some((r, c));
        indptr[c + 1] += 1;
    }
    for c in 0..ncols {
        indptr[c + 1] += indptr[c];
    }
    Ok(CsMat::new_csc(shape, indptr, rows, vals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn example() -> CsMat<u32> {
        // 3 genes x 4 cells
        let mut t = TriMat::new((3, 4));
        t.add_triplet(0, 0, 1);
        t.add_triplet(2, 0, 5);
        t.add_triplet(1, 1, 2);
        t.add_triplet(0, 3, 7);
        t.add_triplet(2, 3, 3);
        t.to_csc()
    }

    #[test]
    fn test_select_cols() {
        let m = select_cols(&example(), &[0, 3]);
        assert_eq!(m.shape(), (3, 2));
        assert_eq!(m.get(2, 0), Some(&5));
        assert_eq!(m.get(0, 1), Some(&7));
        assert_eq!(m.nnz(), 4);
    }

    #[test]
    fn test_select_rows() {
        let m = select_rows(&example(), &[0, 2]);
        assert_eq!(m.shape(), (2, 4));
        assert_eq!(m.get(1, 0), Some(&5));
        assert_eq!(m.get(1, 3), Some(&3));
        assert_eq!(m.nnz(), 4);
    }

    #[test]
    fn test_triplets() {
        let m = example();
        let (r, c, v) = csc_triplets(&m);
        assert_eq!(c, vec![0, 0, 1, 3, 3]);
        let back = from_csc_triplets(m.shape(), r, c, v).unwrap();
        assert_eq!(back, m);

        assert!(from_csc_triplets::<u32>((2, 2), vec![1, 0], vec![0, 0], vec![1, 1]).is_err());
        assert!(from_csc_triplets::<u32>((2, 2), vec![2], vec![0], vec![1]).is_err());
        assert!(from_csc_triplets::<u32>((2, usize::MAX), vec![], vec![], vec![]).is_err());
    }
}
