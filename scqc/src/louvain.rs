//! Multi-level Louvain community detection on a weighted, undirected network.

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Weighted undirected network in adjacency-list form. Node weights are the weighted
/// degree for a network built from edges; intra-node edge weight of aggregated networks
/// is kept separately so modularity stays defined against the original total.
#[derive(Clone, Debug, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    adjacency: Vec<Vec<(usize, f64)>>,
    self_weight: f64,
}

impl Network {
    /// Build a network with `n_nodes` nodes from an edge list. Duplicate and reversed
    /// pairs collapse into one edge of weight 1; self loops are ignored.
    pub fn from_edges<I: Iterator<Item = (u32, u32)>>(n_nodes: usize, edges: I) -> Network {
        let mut seen: Vec<fxhash::FxHashSet<u32>> = vec![Default::default(); n_nodes];
        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut node_weights = vec![0.0; n_nodes];
        for (i, j) in edges {
            if i == j {
                continue;
            }
            let (i, j) = if i < j { (i, j) } else { (j, i) };
            if seen[i as usize].insert(j) {
                adjacency[i as usize].push((j as usize, 1.0));
                adjacency[j as usize].push((i as usize, 1.0));
                // weights are just degree here
                node_weights[i as usize] += 1.0;
                node_weights[j as usize] += 1.0;
            }
        }
        Network {
            node_weights,
            adjacency,
            self_weight: 0.0,
        }
    }

    /// Number of nodes in the network
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Weight of `node`
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Pairs of (adjacent node, edge weight) for all neighbors of `node`
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Total edge weight, counting each edge once and including weight folded into nodes
    pub fn total_edge_weight(&self) -> f64 {
        let between: f64 = self.adjacency.iter().flatten().map(|(_, w)| w).sum::<f64>() / 2.0;
        between + self.self_weight
    }

    /// Aggregate network with one node per cluster of `c`. Node weights add up; edges
    /// between two clusters add up; edges inside a cluster move to the self weight.
    pub fn reduce(&self, c: &Clustering) -> Network {
        let k = c.num_clusters();
        let mut node_weights = vec![0.0; k];
        for i in 0..self.nodes() {
            node_weights[c.get(i)] += self.weight(i);
        }
        let mut memo: HashMap<(usize, usize), f64> = HashMap::new();
        let mut self_weight = self.self_weight;
        for i in 0..self.nodes() {
            for (j, w) in self.neighbors(i) {
                if j < i {
                    continue;
                }
                let (ci, cj) = (c.get(i), c.get(j));
                if ci == cj {
                    self_weight += w;
                } else {
                    *memo.entry((ci.min(cj), ci.max(cj))).or_insert(0.0) += w;
                }
            }
        }
        let mut pairs: Vec<_> = memo.into_iter().collect();
        pairs.sort_by_key(|&(pair, _)| pair);
        let mut adjacency = vec![Vec::new(); k];
        for ((a, b), w) in pairs {
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }
        Network {
            node_weights,
            adjacency,
            self_weight,
        }
    }
}

/// Cluster label per node, with labels `0..num_clusters`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Clustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl Clustering {
    /// Each node in its own cluster
    pub fn singletons(n: usize) -> Clustering {
        Clustering {
            labels: (0..n).collect(),
            num_clusters: n,
        }
    }

    /// Label of node `i`
    pub fn get(&self, i: usize) -> usize {
        self.labels[i]
    }

    fn set(&mut self, i: usize, label: usize) {
        self.labels[i] = label;
        self.num_clusters = self.num_clusters.max(label + 1);
    }

    /// Number of distinct labels
    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// Labels in node order
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Renumber labels densely, keeping their relative order
    fn remove_empty_clusters(&mut self) {
        let mut used = vec![false; self.num_clusters];
        self.labels.iter().for_each(|&l| used[l] = true);
        let mut new_id = vec![0; self.num_clusters];
        let mut next = 0;
        for (l, &u) in used.iter().enumerate() {
            if u {
                new_id[l] = next;
                next += 1;
            }
        }
        self.labels.iter_mut().for_each(|l| *l = new_id[*l]);
        self.num_clusters = next;
    }

    /// Relabel each node with the label its cluster got in `coarse`
    fn merge_clusters(&mut self, coarse: &Clustering) {
        for l in self.labels.iter_mut() {
            *l = coarse.get(*l);
        }
        self.num_clusters = coarse.num_clusters();
        self.remove_empty_clusters();
    }
}

/// Move nodes one at a time to the neighboring cluster with the largest modularity gain
#[derive(Default)]
struct StandardLocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

fn zeroed<T: Default + Clone>(v: &mut Vec<T>, len: usize) {
    v.clear();
    v.resize(len, T::default());
}

impl StandardLocalMoving {
    fn new(resolution: f64) -> Self {
        StandardLocalMoving {
            resolution,
            ..StandardLocalMoving::default()
        }
    }

    fn iterate(&mut self, n: &Network, c: &mut Clustering, rng: &mut impl Rng) -> bool {
        let nodes = n.nodes();
        if nodes == 0 {
            return false;
        }
        let total_edge_weight = n.total_edge_weight();
        if total_edge_weight <= 0.0 {
            return false;
        }
        let mut update = false;

        zeroed(&mut self.cluster_weights, nodes);
        zeroed(&mut self.nodes_per_cluster, nodes);
        for i in 0..nodes {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        // stack of unused cluster ids
        zeroed(&mut self.unused_clusters, nodes);
        let mut num_unused_clusters = 0;
        for i in (0..nodes).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters[num_unused_clusters] = i;
                num_unused_clusters += 1;
            }
        }

        self.node_order.clear();
        self.node_order.extend(0..nodes);
        self.node_order.shuffle(rng);

        zeroed(&mut self.edge_weight_per_cluster, nodes);
        zeroed(&mut self.neighboring_clusters, nodes + 1);

        // each node is visited once, in random order
        for idx in 0..nodes {
            let j = self.node_order[idx];
            let current_cluster = c.get(j);

            self.cluster_weights[current_cluster] -= n.weight(j);
            self.nodes_per_cluster[current_cluster] -= 1;
            if self.nodes_per_cluster[current_cluster] == 0 {
                self.unused_clusters[num_unused_clusters] = current_cluster;
                num_unused_clusters += 1;
            }

            // an empty cluster is always a candidate
            self.neighboring_clusters[0] = self.unused_clusters[num_unused_clusters - 1];
            let mut num_neighboring_clusters = 1;
            for (target, edge_weight) in n.neighbors(j) {
                let neighbor_cluster = c.get(target);
                if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                    self.neighboring_clusters[num_neighboring_clusters] = neighbor_cluster;
                    num_neighboring_clusters += 1;
                }
                self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
            }

            // equal gains go to the smaller cluster id
            let (wj, resolution) = (n.weight(j), self.resolution);
            let gain = |ew: f64, cw: f64| ew - wj * cw * resolution / (2.0 * total_edge_weight);
            let mut best_cluster = current_cluster;
            let mut max_gain = gain(
                self.edge_weight_per_cluster[current_cluster],
                self.cluster_weights[current_cluster],
            );
            for &l in &self.neighboring_clusters[..num_neighboring_clusters] {
                let g = gain(self.edge_weight_per_cluster[l], self.cluster_weights[l]);
                if g > max_gain {
                    best_cluster = l;
                    max_gain = g;
                } else if g == max_gain && l < best_cluster {
                    best_cluster = l;
                }
            }
            for &l in &self.neighboring_clusters[..num_neighboring_clusters] {
                self.edge_weight_per_cluster[l] = 0.0;
            }

            self.cluster_weights[best_cluster] += n.weight(j);
            self.nodes_per_cluster[best_cluster] += 1;
            if best_cluster == self.unused_clusters[num_unused_clusters - 1] {
                num_unused_clusters -= 1;
            }

            if best_cluster != current_cluster {
                c.set(j, best_cluster);
                update = true;
            }
        }

        if update {
            c.remove_empty_clusters();
        }
        update
    }
}

/// Perform the Louvain clustering algorithm
pub struct Louvain {
    rng: ChaCha20Rng,
    local_moving: StandardLocalMoving,
}

impl Louvain {
    /// Initialize Louvain with the given resolution and random seed
    pub fn new(resolution: f64, seed: u64) -> Louvain {
        Louvain {
            rng: ChaCha20Rng::seed_from_u64(seed),
            local_moving: StandardLocalMoving::new(resolution),
        }
    }

    /// Iterate the Louvain algorithm one step: local moving, then recursion on the
    /// aggregated network. Returns true if cluster labels were updated.
    pub fn iterate(&mut self, n: &Network, c: &mut Clustering) -> bool {
        let mut update = self.local_moving.iterate(n, c, &mut self.rng);

        if c.num_clusters() == n.nodes() {
            return update;
        }

        let reduced = n.reduce(c);
        let mut reduced_clusters = Clustering::singletons(reduced.nodes());
        update |= self.iterate(&reduced, &mut reduced_clusters);
        c.merge_clusters(&reduced_clusters);

        update
    }

    /// Cluster `n` from singletons, iterating until labels stop changing or
    /// `max_iterations` is reached.
    pub fn run(&mut self, n: &Network, max_iterations: usize) -> Clustering {
        let mut c = Clustering::singletons(n.nodes());
        for _ in 0..max_iterations {
            if !self.iterate(n, &mut c) {
                break;
            }
        }
        c
    }
}

/// Newman-Girvan modularity of `c` at `resolution`
pub fn modularity(n: &Network, c: &Clustering, resolution: f64) -> f64 {
    let m = n.total_edge_weight();
    if m <= 0.0 {
        return 0.0;
    }
    let mut internal = vec![0.0; c.num_clusters()];
    let mut degree = vec![0.0; c.num_clusters()];
    for i in 0..n.nodes() {
        degree[c.get(i)] += n.weight(i);
        for (j, w) in n.neighbors(i) {
            if c.get(j) == c.get(i) {
                internal[c.get(i)] += w / 2.0;
            }
        }
    }
    internal
        .iter()
        .zip(&degree)
        .map(|(e, d)| e / m - resolution * (d / (2.0 * m)).powi(2))
        .sum::<f64>()
        + n.self_weight / m
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `k` cliques of `size` nodes joined in a ring by single edges
    fn ring_of_cliques(k: usize, size: usize) -> Network {
        let mut edges = Vec::new();
        for c in 0..k {
            let base = c * size;
            for a in 0..size {
                for b in a + 1..size {
                    edges.push(((base + a) as u32, (base + b) as u32));
                }
            }
            let next = ((c + 1) % k) * size;
            edges.push((base as u32, next as u32));
        }
        Network::from_edges(k * size, edges.into_iter())
    }

    #[test]
    fn finds_cliques() {
        let n = ring_of_cliques(6, 5);
        let c = Louvain::new(DEFAULT_RESOLUTION, 0).run(&n, 10);
        assert_eq!(c.num_clusters(), 6);
        for clique in 0..6 {
            let l = c.get(clique * 5);
            for i in 0..5 {
                assert_eq!(c.get(clique * 5 + i), l);
            }
        }
        assert!(modularity(&n, &c, 1.0) > 0.6);
    }

    #[test]
    fn reduction_preserves_totals() {
        let n = ring_of_cliques(3, 4);
        let labels: Vec<usize> = (0..12).map(|i| i / 4).collect();
        let c = Clustering {
            labels,
            num_clusters: 3,
        };
        let r = n.reduce(&c);
        assert_eq!(r.nodes(), 3);
        assert_eq!(r.total_edge_weight(), n.total_edge_weight());
        assert_eq!(r.weight(0), n.weight(0) + n.weight(1) + n.weight(2) + n.weight(3));
        let single = Clustering::singletons(3);
        assert!((modularity(&r, &single, 1.0) - modularity(&n, &c, 1.0)).abs() < 1e-12);
    }

    #[test]
    fn equal_gain_goes_to_smaller_cluster() {
        // triangles {0, 1, 2} and {3, 4, 5}; node 6 hangs off 0 and 3 with identical gain to either
        let edges = [(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5), (6, 0), (6, 3)];
        let n = Network::from_edges(7, edges.into_iter());
        for (a, b) in [(1, 0), (0, 1)] {
            for seed in 0..8 {
                let mut c = Clustering {
                    labels: vec![a, a, a, b, b, b, 2],
                    num_clusters: 3,
                };
                let mut rng = ChaCha20Rng::seed_from_u64(seed);
                assert!(StandardLocalMoving::new(1.0).iterate(&n, &mut c, &mut rng));
                assert_eq!(c.num_clusters(), 2);
                assert_eq!(c.get(6), 0);
                assert_eq!(c.get(0), a);
                assert_eq!(c.get(3), b);
            }
        }
    }

    #[test]
    fn seeded_runs_repeat() {
        let n = ring_of_cliques(5, 6);
        let a = Louvain::new(1.0, 42).run(&n, 10);
        let b = Louvain::new(1.0, 42).run(&n, 10);
        assert_eq!(a, b);
    }
}
