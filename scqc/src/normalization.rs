use crate::stats::median;
use log::{debug, info, warn};
use scqc_types::sparse::{CountMatrix, ExprMatrix};
use scqc_types::{Dataset, Result, ScqcError};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::fmt;
use std::str::FromStr;

const STAGE: &str = "normalize";

/// Per-cell scale factor estimation, the numerics capability behind the normalizer.
pub trait SizeFactorEstimator {
    /// Return one positive scale factor per column of the genes x cells `counts`.
    fn estimate_size_factors(&self, counts: &CountMatrix) -> Result<Vec<f64>>;
}

impl<T: SizeFactorEstimator + ?Sized> SizeFactorEstimator for Box<T> {
    fn estimate_size_factors(&self, counts: &CountMatrix) -> Result<Vec<f64>> {
        (**self).estimate_size_factors(counts)
    }
}

/// Size factor estimation scheme
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeFactorMethod {
    /// library size scaled to unit mean
    Library,
    /// pooled deconvolution over ring-ordered cells
    #[default]
    Deconvolution,
}

impl FromStr for SizeFactorMethod {
    type Err = ScqcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library" => Ok(SizeFactorMethod::Library),
            "deconvolution" => Ok(SizeFactorMethod::Deconvolution),
            _ => Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "method",
                reason: format!("size factor method not recognized: {s}"),
            }),
        }
    }
}

impl fmt::Display for SizeFactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SizeFactorMethod::Library => "library",
            SizeFactorMethod::Deconvolution => "deconvolution",
        })
    }
}

impl SizeFactorMethod {
    /// Default estimator implementing this method
    pub fn estimator(self) -> Box<dyn SizeFactorEstimator> {
        match self {
            SizeFactorMethod::Library => Box::new(LibrarySizeFactors),
            SizeFactorMethod::Deconvolution => Box::new(DeconvolutionSizeFactors::default()),
        }
    }
}

/// Column sums of a CSC count matrix
pub fn library_sizes(counts: &CountMatrix) -> Vec<f64> {
    counts
        .outer_iterator()
        .map(|col| col.iter().map(|(_, &v)| v as f64).sum())
        .collect()
}

fn centre(mut sf: Vec<f64>) -> Vec<f64> {
    if sf.is_empty() {
        return sf;
    }
    let mean = sf.iter().sum::<f64>() / sf.len() as f64;
    if mean > 0.0 {
        sf.iter_mut().for_each(|x| *x /= mean);
    }
    sf
}

/// Library size divided by the mean library size
#[derive(Clone, Copy, Debug, Default)]
pub struct LibrarySizeFactors;

impl SizeFactorEstimator for LibrarySizeFactors {
    fn estimate_size_factors(&self, counts: &CountMatrix) -> Result<Vec<f64>> {
        Ok(centre(library_sizes(counts)))
    }
}

/// Pooling/deconvolution size factors.
///
/// Cells are ordered by library size and arranged in a ring; for every pool size and
/// every ring position, a window of adjacent cells is summed (after library-size
/// scaling) and compared gene-wise with the average cell. The median ratio of each
/// pool is the sum of its members' scaling factors, which gives an overdetermined
/// linear system. Low-weight per-cell equations keep it full rank. The system is solved
/// in the least-squares sense, factors are multiplied back by library size and
/// centred to unit mean.
#[derive(Clone, Debug, SmartDefault)]
pub struct DeconvolutionSizeFactors {
    /// window sizes; sizes larger than the number of cells are dropped
    #[default(vec![21, 41, 61, 81, 101])]
    pub pool_sizes: Vec<usize>,
    /// genes with a lower average count are not used for ratios
    #[default = 0.1]
    pub min_mean: f64,
    /// relative residual at which the least-squares solve stops
    #[default = 1e-10]
    pub tolerance: f64,
}

/// Weight of the per-cell stabilizing equations
const LOW_WEIGHT: f64 = 1e-6;

/// A window of `size` consecutive ring positions starting at `start`
struct Pool {
    start: usize,
    size: usize,
    estimate: f64,
}

impl DeconvolutionSizeFactors {
    /// Ring order: odd ranks ascending then even ranks descending, so each window mixes
    /// small and large libraries.
    fn ring(lib: &[f64]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..lib.len()).collect();
        order.sort_by(|&a, &b| lib[a].total_cmp(&lib[b]).then(a.cmp(&b)));
        let mut ring: Vec<usize> = order.iter().copied().step_by(2).collect();
        ring.extend(order.iter().copied().skip(1).step_by(2).rev());
        ring
    }

    fn pool_sizes(&self, n: usize) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.pool_sizes.iter().copied().filter(|&s| s > 0 && s <= n).collect();
        sizes.sort_unstable();
        sizes.dedup();
        if sizes.is_empty() {
            sizes.push(n);
        }
        sizes
    }

    /// Scaled expression `c_gj / lib_j` for the genes in `gene_index` (dense per cell)
    fn scaled_columns(counts: &CountMatrix, lib: &[f64], gene_index: &[usize]) -> Vec<Vec<(usize, f64)>> {
        counts
            .outer_iterator()
            .enumerate()
            .map(|(j, col)| {
                col.iter()
                    .filter_map(|(g, &v)| {
                        let k = gene_index[g];
                        (k != usize::MAX && v > 0).then(|| (k, v as f64 / lib[j]))
                    })
                    .collect()
            })
            .collect()
    }

    fn build_pools(&self, ring: &[usize], scaled: &[Vec<(usize, f64)>], reference: &[f64]) -> Vec<Pool> {
        let n = ring.len();
        let mut pools = Vec::new();
        let mut ratios = vec![0.0; reference.len()];
        for size in self.pool_sizes(n) {
            let mut acc = vec![0.0; reference.len()];
            for &j in &ring[..size] {
                for &(k, x) in &scaled[j] {
                    acc[k] += x;
                }
            }
            for start in 0..n {
                if start > 0 {
                    for &(k, x) in &scaled[ring[start - 1]] {
                        acc[k] -= x;
                    }
                    for &(k, x) in &scaled[ring[(start + size - 1) % n]] {
                        acc[k] += x;
                    }
                }
                for (r, (&a, &m)) in ratios.iter_mut().zip(acc.iter().zip(reference)) {
                    *r = a.max(0.0) / m;
                }
                let estimate = median(&ratios).unwrap_or(0.0);
                pools.push(Pool { start, size, estimate });
            }
        }
        pools
    }

    /// Least-squares solve of the pool system by conjugate gradients on the normal equations
    fn solve(&self, ring: &[usize], pools: &[Pool], prior: f64) -> Vec<f64> {
        let n = ring.len();
        let w = LOW_WEIGHT.sqrt();

        // y = A x, then A^T y
        let normal_matvec = |x: &[f64], out: &mut [f64]| {
            out.iter_mut().for_each(|o| *o = 0.0);
            for p in pools {
                let s: f64 = (0..p.size).map(|k| x[ring[(p.start + k) % n]]).sum();
                for k in 0..p.size {
                    out[ring[(p.start + k) % n]] += s;
                }
            }
            for j in 0..n {
                out[j] += w * w * x[j];
            }
        };

        let mut rhs = vec![w * w * prior; n];
        for p in pools {
            for k in 0..p.size {
                rhs[ring[(p.start + k) % n]] += p.estimate;
            }
        }

        let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
        let mut x = vec![prior; n];
        let mut ax = vec![0.0; n];
        normal_matvec(&x, &mut ax);
        let mut r: Vec<f64> = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
        let mut p = r.clone();
        let mut rr = dot(&r, &r);
        let target = self.tolerance * self.tolerance * dot(&rhs, &rhs);
        let max_iter = 10 * n + 100;
        let mut ap = vec![0.0; n];
        let mut iter = 0;
        while rr > target && iter < max_iter {
            normal_matvec(&p, &mut ap);
            let pap = dot(&p, &ap);
            if pap <= 0.0 {
                break;
            }
            let alpha = rr / pap;
            for j in 0..n {
                x[j] += alpha * p[j];
                r[j] -= alpha * ap[j];
            }
            let rr_next = dot(&r, &r);
            let beta = rr_next / rr;
            for j in 0..n {
                p[j] = r[j] + beta * p[j];
            }
            rr = rr_next;
            iter += 1;
        }
        debug!("deconvolution solve: {iter} iterations, residual {:.3e}", rr.sqrt());
        x
    }
}

impl SizeFactorEstimator for DeconvolutionSizeFactors {
    fn estimate_size_factors(&self, counts: &CountMatrix) -> Result<Vec<f64>> {
        let n = counts.cols();
        if n == 0 {
            return Ok(vec![]);
        }
        let lib = library_sizes(counts);
        if let Some(j) = lib.iter().position(|&l| l <= 0.0) {
            return Err(ScqcError::DegenerateInput {
                stage: STAGE,
                id: format!("cell {j}"),
                reason: "zero library size".to_string(),
            });
        }

        // genes used for ratios, by average count
        let mut gene_sum = vec![0.0; counts.rows()];
        for col in counts.outer_iterator() {
            for (g, &v) in col.iter() {
                gene_sum[g] += v as f64;
            }
        }
        let mut keep: Vec<usize> = (0..counts.rows())
            .filter(|&g| gene_sum[g] / n as f64 >= self.min_mean)
            .collect();
        if keep.is_empty() {
            warn!("no gene reaches mean count {}; using every detected gene", self.min_mean);
            keep = (0..counts.rows()).filter(|&g| gene_sum[g] > 0.0).collect();
        }
        let mut gene_index = vec![usize::MAX; counts.rows()];
        for (k, &g) in keep.iter().enumerate() {
            gene_index[g] = k;
        }

        let scaled = Self::scaled_columns(counts, &lib, &gene_index);
        let mut reference = vec![0.0; keep.len()];
        for col in &scaled {
            for &(k, x) in col {
                reference[k] += x;
            }
        }
        reference.iter_mut().for_each(|r| *r /= n as f64);
        let prior = 1.0 / reference.iter().sum::<f64>();

        let ring = Self::ring(&lib);
        let pools = self.build_pools(&ring, &scaled, &reference);
        info!(
            "deconvolution: {} cells, {} genes, {} pools",
            n,
            keep.len(),
            pools.len()
        );
        let theta = self.solve(&ring, &pools, prior);
        Ok(centre(theta.iter().zip(&lib).map(|(t, l)| t * l).collect()))
    }
}

/// `ln(1 + count / size_factor)` with the sparsity pattern of `counts`
pub fn log_normalize(counts: &CountMatrix, size_factors: &[f64]) -> ExprMatrix {
    let mut indptr = Vec::with_capacity(counts.cols() + 1);
    let mut indices = Vec::with_capacity(counts.nnz());
    let mut data = Vec::with_capacity(counts.nnz());
    indptr.push(0);
    for (col, sf) in counts.outer_iterator().zip(size_factors) {
        for (g, &v) in col.iter() {
            indices.push(g);
            data.push((v as f64 / sf).ln_1p());
        }
        indptr.push(indices.len());
    }
    ExprMatrix::new_csc(counts.shape(), indptr, indices, data)
}

/// Computes size factors and the log-normalized layer
#[derive(Clone, Debug, Default)]
pub struct Normalizer<E> {
    estimator: E,
}

impl<E: SizeFactorEstimator> Normalizer<E> {
    /// Normalize with size factors from `estimator`
    pub fn new(estimator: E) -> Normalizer<E> {
        Normalizer { estimator }
    }

    /// Return a copy of `ds` with size factors and a log-normalized layer
    pub fn normalize(&self, ds: &Dataset) -> Result<Dataset> {
        if ds.normalized().is_some() {
            return Err(ScqcError::StageOrder {
                stage: STAGE,
                reason: "dataset already has a normalized layer".to_string(),
            });
        }
        let lib = library_sizes(ds.counts());
        if let Some(j) = lib.iter().position(|&l| l == 0.0) {
            return Err(ScqcError::DegenerateInput {
                stage: STAGE,
                id: ds.cells().cell_ids[j].clone(),
                reason: "zero total counts".to_string(),
            });
        }

        let size_factors = self.estimator.estimate_size_factors(ds.counts())?;
        if size_factors.len() != ds.n_cells() {
            return Err(ScqcError::shape(STAGE, "size factors", ds.n_cells(), size_factors.len()));
        }
        if let Some(j) = size_factors.iter().position(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(ScqcError::DegenerateInput {
                stage: STAGE,
                id: ds.cells().cell_ids[j].clone(),
                reason: format!("size factor {} is not a positive finite number", size_factors[j]),
            });
        }

        let layer = log_normalize(ds.counts(), &size_factors);
        info!(
            "normalized {} cells x {} genes; size factors {:.3}..{:.3}",
            ds.n_cells(),
            ds.n_genes(),
            size_factors.iter().copied().fold(f64::INFINITY, f64::min),
            size_factors.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        );
        ds.clone().with_normalized(size_factors, layer)
    }
}
