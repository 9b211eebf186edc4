use ball_tree::{BallTree, Point};
use log::info;
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2, Axis};
use num_traits::bounds::Bounded;
use num_traits::cast::FromPrimitive;
use num_traits::identities::Zero;

#[derive(PartialEq)]
struct Pt(Vec<f64>);

impl Point for Pt {
    fn distance(&self, other: &Self) -> f64 {
        sq_distance(&self.0, &other.0).sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total_dist = self.distance(other);
        let frac = if total_dist == 0.0 { 0.0 } else { d / total_dist };

        Pt(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&s, &o)| s + frac * (o - s))
            .collect())
    }
}

fn sq_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance. Each row represents a
/// n-dimensional vector where n is the number of columns in `v`. Neighbors are listed nearest first; equal
/// distances are ordered by row index. `k` must be smaller than the number of rows.
pub fn knn<T>(v: &ArrayView2<f64>, k: usize) -> Array2<T>
where
    T: Bounded + Clone + Copy + FromPrimitive + Send + Sync + Zero,
{
    let (cells, _) = v.dim();
    let mut output = Array2::from_elem((cells, k), T::max_value());
    if cells == 0 || k == 0 {
        return output;
    }

    info!("constructing ball tree of {} points", cells);
    let points: Vec<Pt> = v.outer_iter().map(|r| Pt(r.to_vec())).collect();
    let ball_tree = BallTree::new(points, (0..cells).collect::<Vec<usize>>());

    info!("querying points for {} neighbors", k);
    output.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each_init(
        || (ball_tree.query(), Vec::with_capacity(k + 1)),
        |(query, candidates), (cell, mut output)| {
            let pt = Pt(v.row(cell).to_vec());
            // keep pulling past the k-th neighbor while distances tie with it
            candidates.clear();
            let mut cutoff = f64::INFINITY;
            for (_, d, &other) in query.nn(&pt) {
                if candidates.len() >= k && d > cutoff {
                    break;
                }
                if other == cell {
                    continue;
                }
                let d2: f64 = pt.0.iter().zip(v.row(other).iter()).map(|(x, y): (&f64, &f64)| (x - y).powi(2)).sum();
                candidates.push((d2, other));
                if candidates.len() == k {
                    cutoff = d;
                }
            }
            candidates.sort_by(|a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for (ind, &(_, other)) in candidates.iter().take(k).enumerate() {
                if let Some(x) = T::from_usize(other) {
                    output[ind] = x;
                }
            }
        },
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;

    // Basic n^2 knn algorithm with a full sort, for testing purposes
    fn sorted_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.shape()[0];
        let mut output = Array2::zeros((cells, k));
        for cell in 0..cells {
            let mut nns: Vec<(f64, usize)> = (0..cells)
                .filter(|&o| o != cell)
                .map(|o| {
                    let d: f64 = v.row(cell).iter().zip(v.row(o).iter()).map(|(a, b)| (a - b).powi(2)).sum();
                    (d, o)
                })
                .collect();
            nns.sort_by(|a, b| a.partial_cmp(b).unwrap());
            for i in 0..k {
                output[(cell, i)] = nns[i].1;
            }
        }
        output
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let dist = Normal::new(0.0f64, 1.0f64).unwrap();
        for ncells in &[3, 5, 50] {
            for d in &[1, 2, 5, 20] {
                let v = Array2::from_shape_simple_fn((*ncells, *d), || dist.sample(&mut rng));
                let full = sorted_knn(&v.view(), ncells - 1);
                for k in [1, 2, 10, 25] {
                    if k >= *ncells {
                        continue;
                    }
                    let fast = knn::<usize>(&v.view(), k);
                    assert_eq!(fast, full.slice(s![.., 0..k]).to_owned());
                }
            }
        }
    }

    #[test]
    fn test_ties_by_index() {
        // corners of a unit square: two neighbors at distance 1 for every point
        let v = ndarray::arr2(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let nn = knn::<u32>(&v.view(), 2);
        assert_eq!(nn, ndarray::arr2(&[[1, 2], [0, 3], [0, 3], [1, 2]]));
    }

    #[test]
    fn test_duplicate_points() {
        // five copies of one point and an outlier; copies must come back in index order
        let mut v = Array2::zeros((6, 3));
        v.row_mut(5).fill(4.0);
        let nn = knn::<usize>(&v.view(), 3);
        assert_eq!(nn.row(0).to_vec(), vec![1, 2, 3]);
        assert_eq!(nn.row(2).to_vec(), vec![0, 1, 3]);
        assert_eq!(nn.row(4).to_vec(), vec![0, 1, 2]);
        assert_eq!(nn.row(5).to_vec(), vec![0, 1, 2]);
    }

    #[test]
    fn test_symmetry() {
        // identity rows are mutually equidistant; the outlier is nobody's neighbor
        let mut v = Array2::<f64>::zeros((6, 5));
        v.slice_mut(s![..5, ..]).assign(&Array2::eye(5));
        v.row_mut(5).fill(10.0);
        let nn = knn::<u32>(&v.view(), 4);
        for cell in 0..5u32 {
            let expected: Vec<u32> = (0..5).filter(|&o| o != cell).collect();
            assert_eq!(nn.row(cell as usize).to_vec(), expected);
        }
        assert_eq!(nn.row(5).to_vec(), vec![0, 1, 2, 3]);
    }
}
