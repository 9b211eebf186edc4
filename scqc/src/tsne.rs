#![allow(non_snake_case)]

//! Barnes-Hut t-SNE.
//!
//! Input affinities are sparse: each cell only has mass on its `3 * perplexity` nearest
//! neighbors. Repulsive forces are approximated with a space-partitioning tree over the
//! embedding, so memory and time per iteration stay close to O(n log n).

use crate::embed::NonLinearEmbedding;
use crate::nn::knn;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use scqc_types::{Result, ScqcError};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use sprs::{CsMat, TriMat};

const STAGE: &str = "embed";

/// t-SNE with Barnes-Hut approximated gradients.
///
/// Optimization follows the usual schedule: early exaggeration of the input affinities
/// until `stop_lying_iter`, momentum 0.5 switching to 0.8 at `mom_switch_iter`, and
/// per-coordinate adaptive gains.
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BarnesHutTsne {
    /// output dimensions, 1 to 3
    #[default = 2]
    pub n_dims: usize,
    /// effective number of neighbors; lowered to (n - 1) / 3 for small inputs
    #[default = 30.]
    pub perplexity: f64,
    /// accuracy of the repulsive force approximation; 0 is exact
    #[default = 0.5]
    pub theta: f64,
    /// seed of the initial layout
    #[default = 0]
    pub seed: u64,
    /// gradient descent iterations
    #[default = 1000]
    pub max_iter: usize,
    /// iteration at which early exaggeration stops
    #[default = 250]
    pub stop_lying_iter: usize,
    /// iteration at which momentum increases
    #[default = 250]
    pub mom_switch_iter: usize,
    /// gradient descent step size
    #[default = 200.]
    pub learning_rate: f64,
    /// early exaggeration factor
    #[default = 12.]
    pub exaggeration: f64,
}

fn invalid(name: &'static str, reason: String) -> ScqcError {
    ScqcError::InvalidParameter {
        stage: STAGE,
        name,
        reason,
    }
}

fn sq_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y): (&f64, &f64)| (x - y).powi(2)).sum()
}

/// Conditional affinities over the squared neighbor distances `d`, with the Gaussian
/// bandwidth chosen by bisection so that the entropy matches `ln(perplexity)`
fn row_affinities(d: &[f64], perplexity: f64, out: &mut [f64]) {
    let target = perplexity.ln();
    let (mut beta, mut lo, mut hi) = (1.0, f64::NEG_INFINITY, f64::INFINITY);
    for _ in 0..200 {
        let mut sum = 0.0;
        let mut dsum = 0.0;
        for (&dij, p) in d.iter().zip(out.iter_mut()) {
            *p = (-beta * dij).exp();
            sum += *p;
            dsum += dij * *p;
        }
        if sum <= f64::MIN_POSITIVE {
            sum = f64::MIN_POSITIVE;
        }
        let entropy = sum.ln() + beta * dsum / sum;
        let diff = entropy - target;
        out.iter_mut().for_each(|p| *p /= sum);
        if diff.abs() < 1e-5 {
            break;
        }
        if diff > 0.0 {
            lo = beta;
            beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
        } else {
            hi = beta;
            beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
        }
    }
}

/// Symmetrized joint affinities over the nearest neighbors of each row, summing to 1
fn joint_affinities(X: &Array2<f64>, perplexity: f64) -> CsMat<f64> {
    let n = X.nrows();
    let k = ((3.0 * perplexity) as usize).clamp(1, n - 1);
    let neighbors = knn::<usize>(&X.view(), k);

    let conditional: Vec<Vec<f64>> = neighbors
        .axis_iter(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, nbrs)| {
            let d: Vec<f64> = nbrs.iter().map(|&j| sq_distance(X.row(i), X.row(j))).collect();
            let mut p = vec![0.0; k];
            row_affinities(&d, perplexity, &mut p);
            p
        })
        .collect();

    let mut tri = TriMat::with_capacity((n, n), 2 * n * k);
    for (i, p) in conditional.iter().enumerate() {
        for (&j, &pij) in neighbors.row(i).iter().zip(p) {
            tri.add_triplet(i, j, pij);
            tri.add_triplet(j, i, pij);
        }
    }
    let mut P: CsMat<f64> = tri.to_csr();
    let total: f64 = P.data().iter().sum();
    if total > 0.0 {
        P.map_inplace(|&v| v / total);
    }
    P
}

/// Zero-mean input scaled so the largest absolute value is 1
fn normalize_input(data: &ArrayView2<f64>) -> Array2<f64> {
    let mut X = data.to_owned();
    if let Some(mean) = X.mean_axis(Axis(0)) {
        X -= &mean;
    }
    let max = X.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    if max > 0.0 {
        X.mapv_inplace(|x| x / max);
    }
    X
}

const LEAF_CAPACITY: usize = 1;
const MAX_DEPTH: usize = 32;

struct TreeNode {
    centre: Vec<f64>,
    half_width: Vec<f64>,
    centre_of_mass: Vec<f64>,
    cum_size: usize,
    first_child: Option<usize>,
    points: Vec<usize>,
}

impl TreeNode {
    fn new(centre: Vec<f64>, half_width: Vec<f64>) -> TreeNode {
        let dims = centre.len();
        TreeNode {
            centre,
            half_width,
            centre_of_mass: vec![0.0; dims],
            cum_size: 0,
            first_child: None,
            points: Vec::new(),
        }
    }
}

/// Space-partitioning tree over the rows of an embedding: a quadtree in 2 dimensions,
/// an octree in 3. Every node keeps the centre of mass of the points below it.
struct SpaceTree<'a> {
    Y: &'a Array2<f64>,
    nodes: Vec<TreeNode>,
}

impl<'a> SpaceTree<'a> {
    fn new(Y: &'a Array2<f64>) -> SpaceTree<'a> {
        let dims = Y.ncols();
        let mut lo = vec![f64::INFINITY; dims];
        let mut hi = vec![f64::NEG_INFINITY; dims];
        for row in Y.outer_iter() {
            for d in 0..dims {
                lo[d] = lo[d].min(row[d]);
                hi[d] = hi[d].max(row[d]);
            }
        }
        let centre: Vec<f64> = lo.iter().zip(&hi).map(|(l, h)| (l + h) / 2.0).collect();
        let half_width: Vec<f64> = lo.iter().zip(&hi).map(|(l, h)| (h - l) / 2.0 + 1e-5).collect();

        let mut tree = SpaceTree {
            Y,
            nodes: vec![TreeNode::new(centre, half_width)],
        };
        for i in 0..Y.nrows() {
            tree.insert(0, i, 0);
        }
        tree
    }

    fn child_index(&self, node: usize, y: ArrayView1<f64>) -> usize {
        let centre = &self.nodes[node].centre;
        y.iter()
            .zip(centre)
            .enumerate()
            .filter(|(_, (v, c))| v > c)
            .fold(0, |idx, (d, _)| idx | (1 << d))
    }

    fn subdivide(&mut self, node: usize) -> usize {
        let first = self.nodes.len();
        let dims = self.Y.ncols();
        for c in 0..1usize << dims {
            let parent = &self.nodes[node];
            let half_width: Vec<f64> = parent.half_width.iter().map(|w| w / 2.0).collect();
            let centre = (0..dims)
                .map(|d| {
                    let offset = if (c >> d) & 1 == 1 { 0.5 } else { -0.5 };
                    parent.centre[d] + offset * parent.half_width[d]
                })
                .collect();
            self.nodes.push(TreeNode::new(centre, half_width));
        }
        self.nodes[node].first_child = Some(first);
        first
    }

    fn insert(&mut self, node: usize, i: usize, depth: usize) {
        let Y = self.Y;
        let y = Y.row(i);
        let n = &mut self.nodes[node];
        n.cum_size += 1;
        let frac = 1.0 / n.cum_size as f64;
        for (m, &v) in n.centre_of_mass.iter_mut().zip(y.iter()) {
            *m += (v - *m) * frac;
        }

        if let Some(first) = n.first_child {
            let child = first + self.child_index(node, y);
            self.insert(child, i, depth + 1);
            return;
        }

        let duplicate = n.points.iter().all(|&p| Y.row(p) == y);
        if n.points.len() < LEAF_CAPACITY || duplicate || depth >= MAX_DEPTH {
            self.nodes[node].points.push(i);
            return;
        }

        let existing = std::mem::take(&mut self.nodes[node].points);
        let first = self.subdivide(node);
        for p in existing {
            let child = first + self.child_index(node, Y.row(p));
            self.insert(child, p, depth + 1);
        }
        let child = first + self.child_index(node, y);
        self.insert(child, i, depth + 1);
    }

    /// Accumulate the unnormalized repulsive force on row `i` into `neg_f` and return
    /// its share of the normalization sum
    fn repulsion(&self, i: usize, theta: f64, mut neg_f: ArrayViewMut1<f64>, stack: &mut Vec<usize>) -> f64 {
        let yi = self.Y.row(i);
        let mut sum_q = 0.0;
        stack.clear();
        stack.push(0);
        while let Some(node) = stack.pop() {
            let n = &self.nodes[node];
            if n.cum_size == 0 {
                continue;
            }
            match n.first_child {
                None => {
                    for &j in n.points.iter().filter(|&&j| j != i) {
                        let yj = self.Y.row(j);
                        let q = 1.0 / (1.0 + sq_distance(yi, yj));
                        sum_q += q;
                        let mult = q * q;
                        for (f, (a, b)) in neg_f.iter_mut().zip(yi.iter().zip(yj.iter())) {
                            *f += mult * (a - b);
                        }
                    }
                }
                Some(first) => {
                    let D: f64 = yi
                        .iter()
                        .zip(&n.centre_of_mass)
                        .map(|(a, b): (&f64, &f64)| (a - b).powi(2))
                        .sum();
                    let max_width = n.half_width.iter().fold(0.0f64, |m, &w| m.max(w));
                    if D > 0.0 && max_width / D.sqrt() < theta {
                        let q = 1.0 / (1.0 + D);
                        let mult = n.cum_size as f64 * q;
                        sum_q += mult;
                        for (f, (a, b)) in neg_f.iter_mut().zip(yi.iter().zip(&n.centre_of_mass)) {
                            *f += mult * q * (a - b);
                        }
                    } else {
                        stack.extend(first..first + (1 << self.Y.ncols()));
                    }
                }
            }
        }
        sum_q
    }
}

/// Repulsive forces on every row of `Y` and the normalization sum of the Student-t kernel
fn repulsive_forces(Y: &Array2<f64>, theta: f64) -> (Array2<f64>, f64) {
    let tree = SpaceTree::new(Y);
    let mut neg = Array2::zeros(Y.dim());
    let row_q: Vec<f64> = neg
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .map_init(Vec::new, |stack, (i, row)| tree.repulsion(i, theta, row, stack))
        .collect();
    (neg, row_q.iter().sum::<f64>().max(f64::MIN_POSITIVE))
}

impl BarnesHutTsne {
    fn check(&self, n: usize) -> Result<f64> {
        if !(1..=3).contains(&self.n_dims) {
            return Err(invalid("n_dims", format!("{} is not between 1 and 3", self.n_dims)));
        }
        if !(self.perplexity.is_finite() && self.perplexity > 0.0) {
            return Err(invalid("perplexity", format!("{} is not a positive number", self.perplexity)));
        }
        if !(self.theta.is_finite() && self.theta >= 0.0) {
            return Err(invalid("theta", format!("{} is not a non-negative number", self.theta)));
        }
        if n < 2 {
            return Err(invalid("cells", format!("t-SNE needs at least 2 cells, got {n}")));
        }
        let max_perplexity = (n - 1) as f64 / 3.0;
        if self.perplexity > max_perplexity {
            let p = max_perplexity.max(1.0);
            warn!("perplexity {} too large for {} cells; using {:.2}", self.perplexity, n, p);
            return Ok(p);
        }
        Ok(self.perplexity)
    }
}

impl NonLinearEmbedding for BarnesHutTsne {
    fn name(&self) -> &str {
        "tsne"
    }

    fn embed(&self, data: &ArrayView2<f64>) -> Result<Array2<f64>> {
        let n = data.nrows();
        let perplexity = self.check(n)?;
        let X = normalize_input(data);
        let P = joint_affinities(&X, perplexity);
        info!(
            "running t-SNE on {} x {} input, perplexity {:.1}, theta {}, {} affinities",
            n,
            data.ncols(),
            perplexity,
            self.theta,
            P.nnz()
        );

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let normal = Normal::new(0.0, 1e-4).map_err(|e| invalid("seed", e.to_string()))?;
        let dims = self.n_dims;
        let mut Y = Array2::from_shape_simple_fn((n, dims), || normal.sample(&mut rng));
        let mut update = Array2::<f64>::zeros((n, dims));
        let mut gains = Array2::<f64>::ones((n, dims));

        for iter in 0..self.max_iter {
            let exaggeration = if iter < self.stop_lying_iter { self.exaggeration } else { 1.0 };
            let momentum = if iter < self.mom_switch_iter { 0.5 } else { 0.8 };

            let (neg, sum_q) = repulsive_forces(&Y, self.theta);
            let mut grad = Array2::<f64>::zeros((n, dims));
            grad.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each(|(i, mut g)| {
                if let Some(row) = P.outer_view(i) {
                    let yi = Y.row(i);
                    for (j, &p) in row.iter() {
                        let yj = Y.row(j);
                        let w = exaggeration * p / (1.0 + sq_distance(yi, yj));
                        for d in 0..dims {
                            g[d] += w * (yi[d] - yj[d]);
                        }
                    }
                }
                for d in 0..dims {
                    g[d] = 4.0 * (g[d] - neg[[i, d]] / sum_q);
                }
            });

            for ((g, u), gain) in grad.iter().zip(update.iter_mut()).zip(gains.iter_mut()) {
                *gain = if (*g > 0.0) != (*u > 0.0) { *gain + 0.2 } else { *gain * 0.8 };
                *gain = gain.max(0.01);
                *u = momentum * *u - self.learning_rate * *gain * g;
            }
            Y += &update;
            if let Some(mean) = Y.mean_axis(Axis(0)) {
                Y -= &mean;
            }

            if iter % 50 == 49 || iter + 1 == self.max_iter {
                let mut kl = 0.0;
                for (i, row) in P.outer_iterator().enumerate() {
                    for (j, &p) in row.iter().filter(|&(_, &p)| p > 1e-12) {
                        let q = 1.0 / (1.0 + sq_distance(Y.row(i), Y.row(j))) / sum_q;
                        kl += p * (p / q.max(1e-12)).ln();
                    }
                }
                debug!("t-SNE iteration {}: KL divergence {:.4}", iter + 1, kl);
            }
        }
        Ok(Y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(per_blob: usize) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let noise = Normal::new(0.0, 0.1).unwrap();
        Array2::from_shape_fn((2 * per_blob, 5), |(i, _)| {
            let centre = if i < per_blob { 0.0 } else { 5.0 };
            centre + noise.sample(&mut rng)
        })
    }

    fn mean_dist(Y: &Array2<f64>, a: std::ops::Range<usize>, b: std::ops::Range<usize>) -> f64 {
        let mut total = 0.0;
        let mut count = 0.0;
        for i in a.clone() {
            for j in b.clone() {
                if i != j {
                    total += sq_distance(Y.row(i), Y.row(j)).sqrt();
                    count += 1.0;
                }
            }
        }
        total / count
    }

    /// Brute force repulsion for comparison
    fn exact_repulsion(Y: &Array2<f64>) -> (Array2<f64>, f64) {
        let n = Y.nrows();
        let mut neg = Array2::zeros(Y.dim());
        let mut sum_q = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = 1.0 / (1.0 + sq_distance(Y.row(i), Y.row(j)));
                sum_q += q;
                for d in 0..Y.ncols() {
                    neg[[i, d]] += q * q * (Y[[i, d]] - Y[[j, d]]);
                }
            }
        }
        (neg, sum_q)
    }

    #[test]
    fn separates_blobs() {
        let X = blobs(25);
        let tsne = BarnesHutTsne {
            perplexity: 10.0,
            max_iter: 400,
            ..BarnesHutTsne::default()
        };
        let Y = tsne.embed(&X.view()).unwrap();
        assert_eq!(Y.dim(), (50, 2));
        assert!(Y.iter().all(|y| y.is_finite()));
        let within = mean_dist(&Y, 0..25, 0..25).max(mean_dist(&Y, 25..50, 25..50));
        let between = mean_dist(&Y, 0..25, 25..50);
        assert!(between > 2.0 * within, "between {between}, within {within}");

        let again = tsne.embed(&X.view()).unwrap();
        assert_eq!(Y, again);
    }

    #[test]
    fn parameter_checks() {
        let X = blobs(5);
        let bad = BarnesHutTsne {
            perplexity: -1.0,
            ..BarnesHutTsne::default()
        };
        assert!(matches!(bad.embed(&X.view()), Err(ScqcError::InvalidParameter { .. })));
        let bad = BarnesHutTsne {
            n_dims: 4,
            ..BarnesHutTsne::default()
        };
        assert!(matches!(bad.embed(&X.view()), Err(ScqcError::InvalidParameter { name: "n_dims", .. })));
        let bad = BarnesHutTsne {
            theta: -0.5,
            ..BarnesHutTsne::default()
        };
        assert!(matches!(bad.embed(&X.view()), Err(ScqcError::InvalidParameter { name: "theta", .. })));

        // perplexity is lowered to fit 10 points
        let small = BarnesHutTsne {
            max_iter: 50,
            ..BarnesHutTsne::default()
        };
        assert_eq!(small.embed(&X.view()).unwrap().dim(), (10, 2));
    }

    #[test]
    fn affinity_rows_hit_perplexity() {
        let d = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut p = vec![0.0; d.len()];
        row_affinities(&d, 3.0, &mut p);
        let h: f64 = -p.iter().filter(|&&x| x > 0.0).map(|x| x * x.ln()).sum::<f64>();
        assert!((h - 3.0f64.ln()).abs() < 1e-4);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn joint_affinities_are_sparse_and_symmetric() {
        let X = normalize_input(&blobs(30).view());
        let P = joint_affinities(&X, 5.0);
        assert_eq!(P.shape(), (60, 60));
        assert!(P.nnz() <= 2 * 60 * 15);
        assert!((P.data().iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for (i, row) in P.outer_iterator().enumerate() {
            assert!(row.nnz() >= 15);
            for (j, &p) in row.iter() {
                assert_ne!(i, j);
                let back = P.get(j, i).copied().unwrap_or(0.0);
                assert!((p - back).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn repulsion_matches_brute_force() {
        let mut rng = Pcg64Mcg::seed_from_u64(9);
        let normal = Normal::new(0.0, 3.0).unwrap();
        for dims in 1..=3 {
            let mut Y = Array2::from_shape_simple_fn((80, dims), || normal.sample(&mut rng));
            // a repeated point must not count itself
            let first = Y.row(0).to_owned();
            Y.row_mut(1).assign(&first);
            let (exact_neg, exact_q) = exact_repulsion(&Y);

            let (neg, sum_q) = repulsive_forces(&Y, 0.0);
            assert!((sum_q - exact_q).abs() < 1e-9 * exact_q);
            for (a, b) in neg.iter().zip(exact_neg.iter()) {
                assert!((a - b).abs() < 1e-9);
            }

            let (_, approx_q) = repulsive_forces(&Y, 0.5);
            assert!((approx_q - exact_q).abs() < 0.05 * exact_q, "dims {dims}: {approx_q} vs {exact_q}");
        }
    }
}
