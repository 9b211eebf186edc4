#![allow(non_snake_case)]

//! Principal components of the normalized layer.
//!
//! The SVD backend works on a dense cells x genes matrix that the caller has already
//! centred (and optionally scaled), so `run_pca` is a plain truncated SVD. Only the
//! highly variable genes are densified, which keeps the dense block small.

use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use scqc_types::{Dataset, Result, ScqcError};

const STAGE: &str = "embed";

/// `(u, d, v)` with `matrix ~ u * diag(d) * v^T`; `u` is rows x k, `v` is cols x k
pub type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Perform a truncated SVD of a `matrix`, retaining `k` components. Centring and
/// scaling are the caller's job.
pub trait Pca {
    /// Compute a rank `k` decomposition of `matrix`
    fn run_pca(&self, matrix: &ArrayView2<f64>, k: usize) -> Result<PcaResult>;
}

/// Settings for randomized SVD
#[derive(Clone, Debug)]
pub struct RandSvd {
    /// Multiple of the requested k to use in randomized projections
    pub l_multiplier: f64,

    /// Number of power iterations to perform
    pub n_iter: usize,

    /// Seed of the random projection
    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            l_multiplier: 2.0,
            n_iter: 4,
            seed: 0,
        }
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl Pca for RandSvd {
    fn run_pca(&self, A: &ArrayView2<f64>, k: usize) -> Result<PcaResult> {
        let (m, n) = A.dim();
        let available = m.min(n);
        if k == 0 || k > available {
            return Err(ScqcError::InsufficientComponents {
                stage: STAGE,
                requested: k,
                available,
            });
        }
        let l = ((k as f64 * self.l_multiplier).ceil() as usize).max(k + 10).min(available);

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let unif = Uniform::new(-1.0, 1.0);

        let (mut U, d, mut V) = if m >= n {
            let omega = Array2::random_using((n, l), unif, &mut rng);
            let mut Q = qr_basis(&A.dot(&omega));
            for _ in 0..self.n_iter {
                Q = qr_basis(&A.t().dot(&Q));
                Q = qr_basis(&A.dot(&Q));
            }
            let B = Q.t().dot(A);
            let (Ub, sigma, Vbt) = thin_svd(&B)?;
            let U = Q.dot(&Ub.slice(s![.., ..k]));
            let V = Vbt.slice(s![..k, ..]).t().to_owned();
            (U, sigma.slice(s![..k]).to_owned(), V)
        } else {
            let omega = Array2::random_using((l, m), unif, &mut rng);
            let mut Q = qr_basis(&omega.dot(A).reversed_axes());
            for _ in 0..self.n_iter {
                Q = qr_basis(&A.dot(&Q));
                Q = qr_basis(&A.t().dot(&Q));
            }
            let B = A.dot(&Q);
            let (Ub, sigma, Vbt) = thin_svd(&B)?;
            let U = Ub.slice(s![.., ..k]).to_owned();
            let V = Q.dot(&Vbt.slice(s![..k, ..]).t());
            (U, sigma.slice(s![..k]).to_owned(), V)
        };

        // fix the sign of each component so repeated runs agree
        for c in 0..k {
            let sign = largest_entry_sign(V.column(c).iter().copied());
            if sign < 0.0 {
                V.column_mut(c).mapv_inplace(|x| -x);
                U.column_mut(c).mapv_inplace(|x| -x);
            }
        }
        debug!("randomized svd: {m} x {n}, k = {k}, l = {l}, leading value {:.4}", d[0]);
        Ok((U, d, V))
    }
}

fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Orthonormal basis (thin Q factor) of the column space of `Y`
fn qr_basis(Y: &Array2<f64>) -> Array2<f64> {
    from_dmatrix(&to_dmatrix(&Y.view()).qr().q())
}

/// Thin SVD `(u, s, vt)` with singular values in decreasing order
fn thin_svd(B: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>)> {
    let failed = || ScqcError::DegenerateInput {
        stage: STAGE,
        id: "pca".to_string(),
        reason: "singular value decomposition did not converge".to_string(),
    };
    let svd = to_dmatrix(&B.view())
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(failed)?;
    let u = svd.u.as_ref().ok_or_else(failed)?;
    let vt = svd.v_t.as_ref().ok_or_else(failed)?;
    let sv = svd.singular_values.as_slice();

    let mut order: Vec<usize> = (0..sv.len()).collect();
    order.sort_by(|&i, &j| sv[j].total_cmp(&sv[i]).then(i.cmp(&j)));
    let u = from_dmatrix(u).select(Axis(1), &order);
    let vt = from_dmatrix(vt).select(Axis(0), &order);
    let sigma = order.iter().map(|&i| sv[i]).collect();
    Ok((u, sigma, vt))
}

/// Sign of the entry with the largest magnitude (first one on ties), 1.0 for an all-zero vector
fn largest_entry_sign(v: impl IntoIterator<Item = f64>) -> f64 {
    let mut best = 0.0;
    let mut sign = 1.0;
    for x in v {
        if x.abs() > best {
            best = x.abs();
            sign = if x < 0.0 { -1.0 } else { 1.0 };
        }
    }
    sign
}

fn require_normalized(ds: &Dataset) -> Result<&scqc_types::ExprMatrix> {
    ds.normalized().ok_or_else(|| ScqcError::StageOrder {
        stage: STAGE,
        reason: "dimensionality reduction needs a normalized layer".to_string(),
    })
}

/// Per-gene variance of the normalized layer across cells (zeros included)
pub fn gene_variances(ds: &Dataset) -> Result<Vec<f64>> {
    let layer = require_normalized(ds)?;
    let n = ds.n_cells() as f64;
    let mut sum = vec![0.0; ds.n_genes()];
    let mut sum_sq = vec![0.0; ds.n_genes()];
    for col in layer.outer_iterator() {
        for (g, &x) in col.iter() {
            sum[g] += x;
            sum_sq[g] += x * x;
        }
    }
    if n < 2.0 {
        return Ok(vec![0.0; ds.n_genes()]);
    }
    Ok(sum
        .iter()
        .zip(&sum_sq)
        .map(|(s, ss)| ((ss - s * s / n) / (n - 1.0)).max(0.0))
        .collect())
}

/// Indices (ascending) of the `n` genes with the largest normalized variance; ties go
/// to the earlier gene. All genes are returned when `n` exceeds the gene count.
pub fn top_variable_genes(ds: &Dataset, n: usize) -> Result<Vec<usize>> {
    if n == 0 {
        return Err(ScqcError::InvalidParameter {
            stage: STAGE,
            name: "n_top_genes",
            reason: "at least one gene must be selected".to_string(),
        });
    }
    let var = gene_variances(ds)?;
    let mut order: Vec<usize> = (0..var.len()).collect();
    order.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
    order.truncate(n);
    order.sort_unstable();
    info!("selected {} of {} genes by variance", order.len(), var.len());
    Ok(order)
}

/// Dense cells x genes copy of the normalized layer, restricted to `genes` in the given order
pub fn dense_cells_by_genes(ds: &Dataset, genes: &[usize]) -> Result<Array2<f64>> {
    let layer = require_normalized(ds)?;
    let mut column_of = vec![usize::MAX; ds.n_genes()];
    for (j, &g) in genes.iter().enumerate() {
        if g >= ds.n_genes() {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "genes",
                reason: format!("gene index {g} out of range for {} genes", ds.n_genes()),
            });
        }
        column_of[g] = j;
    }
    let mut dense = Array2::zeros((ds.n_cells(), genes.len()));
    for (c, col) in layer.outer_iterator().enumerate() {
        for (g, &x) in col.iter() {
            let j = column_of[g];
            if j != usize::MAX {
                dense[[c, j]] = x;
            }
        }
    }
    Ok(dense)
}

/// Centre every column; with `scale`, also divide by the column standard deviation
/// (constant columns are left at zero).
pub fn center_columns(a: &mut Array2<f64>, scale: bool) {
    let n = a.nrows() as f64;
    for mut col in a.axis_iter_mut(Axis(1)) {
        let mean = col.sum() / n;
        col.mapv_inplace(|x| x - mean);
        if scale && n > 1.0 {
            let sd = (col.iter().map(|x| x * x).sum::<f64>() / (n - 1.0)).sqrt();
            if sd > 0.0 {
                col.mapv_inplace(|x| x / sd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand_distr::{Distribution, Normal};

    fn frobenius(a: &ArrayView2<f64>) -> f64 {
        a.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    #[test]
    fn matches_exact_svd_in_both_orientations() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        for shape in [(30, 8), (8, 30)] {
            let a = Array2::from_shape_simple_fn(shape, || normal.sample(&mut rng));
            let (u, d, v) = RandSvd::new().run_pca(&a.view(), 3).unwrap();
            assert_eq!(u.dim(), (shape.0, 3));
            assert_eq!(v.dim(), (shape.1, 3));

            let mut exact = to_dmatrix(&a.view()).singular_values().as_slice().to_vec();
            exact.sort_by(|x, y| y.total_cmp(x));
            for c in 0..3 {
                assert_abs_diff_eq!(d[c], exact[c], epsilon = 1e-8);
            }
            let utu = u.t().dot(&u);
            let vtv = v.t().dot(&v);
            let eye = Array2::<f64>::eye(3);
            assert!(frobenius(&(&utu - &eye).view()) < 1e-8);
            assert!(frobenius(&(&vtv - &eye).view()) < 1e-8);
            // the largest loading of every right vector is positive
            for col in v.columns() {
                let top = col.iter().copied().fold(0.0f64, |b, x| if x.abs() > b.abs() { x } else { b });
                assert!(top > 0.0);
            }
        }
    }

    #[test]
    fn rand_svd_recovers_low_rank() {
        // rank-3 matrix plus tiny noise
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let left = Array2::from_shape_simple_fn((60, 3), || normal.sample(&mut rng));
        let right = Array2::from_shape_simple_fn((3, 40), || normal.sample(&mut rng));
        let noise = Array2::from_shape_simple_fn((60, 40), || 1e-6 * normal.sample(&mut rng));
        let a = left.dot(&right) + noise;

        let (u, d, v) = RandSvd::new().run_pca(&a.view(), 5).unwrap();
        assert_eq!(u.dim(), (60, 5));
        assert_eq!(v.dim(), (40, 5));
        assert!(d[0] >= d[1] && d[1] >= d[2]);
        assert!(d[3] < 1e-3 && d[4] < 1e-3);

        let recon = (&u * &d).dot(&v.t());
        assert!(frobenius(&(&recon - &a).view()) / frobenius(&a.view()) < 1e-4);

        // deterministic for a fixed seed
        let (_, d2, v2) = RandSvd::new().run_pca(&a.view(), 5).unwrap();
        assert_eq!(d, d2);
        assert_eq!(v, v2);
    }

    #[test]
    fn too_many_components() {
        let a = Array2::<f64>::zeros((4, 10));
        assert!(matches!(
            RandSvd::new().run_pca(&a.view(), 5),
            Err(ScqcError::InsufficientComponents {
                requested: 5,
                available: 4,
                ..
            })
        ));
    }

    #[test]
    fn centring_and_scaling() {
        let mut a = ndarray::arr2(&[[1.0, 5.0], [3.0, 5.0]]);
        center_columns(&mut a, true);
        assert_abs_diff_eq!(a[[0, 0]], -std::f64::consts::SQRT_2 / 2.0, epsilon = 1e-12);
        assert_eq!(a.column(1).to_vec(), vec![0.0, 0.0]);
    }
}
