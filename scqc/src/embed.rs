//! Wiring of principal components, non-linear embeddings and graph clustering.
//!
//! The numerics live behind three capabilities ([`Pca`], [`NonLinearEmbedding`],
//! [`GraphClusterer`]); this module picks which coordinates feed each one, checks the
//! requested dimensionality and attaches results to the dataset.

use crate::dim_red::{center_columns, dense_cells_by_genes, Pca};
use crate::louvain::{Louvain, Network, DEFAULT_RESOLUTION};
use crate::nn::knn;
use itertools::Itertools;
use log::info;
use ndarray::{s, Array2, ArrayView2};
use scqc_types::{Dataset, Result, ScqcError};
use serde::{Deserialize, Serialize};

const STAGE: &str = "embed";

/// Name of the principal component embedding
pub const PCA_EMBEDDING: &str = "pca";

/// Default number of nearest neighbors in the clustering graph
pub const DEFAULT_NEIGHBORS: usize = 15;

/// A non-linear low-dimensional embedding of per-cell coordinates
pub trait NonLinearEmbedding {
    /// Name the embedding is stored under
    fn name(&self) -> &str;

    /// Embed the rows of `data` (cells x input dims)
    fn embed(&self, data: &ArrayView2<f64>) -> Result<Array2<f64>>;
}

/// Graph-based clustering of per-cell coordinates
pub trait GraphClusterer {
    /// One label per row of `data`
    fn cluster(&self, data: &ArrayView2<f64>) -> Result<Vec<u32>>;
}

/// kNN graph + Louvain modularity clustering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LouvainClusterer {
    /// neighbors per cell in the graph
    pub n_neighbors: usize,
    /// modularity resolution; higher values give more clusters
    pub resolution: f64,
    /// seed of the node visiting order
    pub seed: u64,
    /// cap on Louvain passes
    pub max_iterations: usize,
}

impl Default for LouvainClusterer {
    fn default() -> Self {
        LouvainClusterer {
            n_neighbors: DEFAULT_NEIGHBORS,
            resolution: DEFAULT_RESOLUTION,
            seed: 0,
            max_iterations: 10,
        }
    }
}

/// Relabel so that label 0 is the largest cluster; equal sizes are ordered by first member
pub fn relabel_by_size(labels: &[usize]) -> Vec<u32> {
    let counts = labels.iter().counts();
    let mut first_seen = fxhash::FxHashMap::default();
    for (i, &l) in labels.iter().enumerate() {
        first_seen.entry(l).or_insert(i);
    }
    let order: Vec<usize> = counts
        .iter()
        .sorted_by_key(|&(&l, &n)| (std::cmp::Reverse(n), first_seen[l]))
        .map(|(&&l, _)| l)
        .collect();
    let mut new_label = fxhash::FxHashMap::default();
    for (rank, l) in order.into_iter().enumerate() {
        new_label.insert(l, rank as u32);
    }
    labels.iter().map(|l| new_label[l]).collect()
}

impl GraphClusterer for LouvainClusterer {
    fn cluster(&self, data: &ArrayView2<f64>) -> Result<Vec<u32>> {
        let n = data.nrows();
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "resolution",
                reason: format!("{} is not a positive number", self.resolution),
            });
        }
        if self.n_neighbors == 0 {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "n_neighbors",
                reason: "at least one neighbor is required".to_string(),
            });
        }
        if n < 2 {
            return Ok(vec![0; n]);
        }
        let k = self.n_neighbors.min(n - 1);
        let neighbors = knn::<u32>(data, k);
        let edges = (0..n).flat_map(|i| neighbors.row(i).to_vec().into_iter().map(move |j| (i as u32, j)));
        let network = Network::from_edges(n, edges);
        let clustering = Louvain::new(self.resolution, self.seed).run(&network, self.max_iterations);
        info!(
            "louvain: {} cells, k = {}, resolution {}, {} clusters",
            n,
            k,
            self.resolution,
            clustering.num_clusters()
        );
        Ok(relabel_by_size(clustering.labels()))
    }
}

/// Principal components, non-linear embedding and clustering over a normalized dataset
pub struct EmbeddingAndClusterer<P, E, C> {
    pca: P,
    embedding: E,
    clusterer: C,
    scale: bool,
}

impl<P: Pca, E: NonLinearEmbedding, C: GraphClusterer> EmbeddingAndClusterer<P, E, C> {
    /// Wire the three capabilities together. Genes are centred but not scaled before PCA.
    pub fn new(pca: P, embedding: E, clusterer: C) -> Self {
        EmbeddingAndClusterer {
            pca,
            embedding,
            clusterer,
            scale: false,
        }
    }

    /// Scale each gene to unit variance before PCA
    pub fn with_scaling(mut self, scale: bool) -> Self {
        self.scale = scale;
        self
    }

    /// Project the normalized layer restricted to `genes` onto `n_components` principal
    /// components and store the cell scores as the `pca` embedding
    pub fn run_pca(&self, ds: &Dataset, genes: &[usize], n_components: usize) -> Result<Dataset> {
        if genes.is_empty() {
            return Err(ScqcError::InvalidParameter {
                stage: STAGE,
                name: "genes",
                reason: "no genes selected for PCA".to_string(),
            });
        }
        let available = ds.n_cells().min(genes.len());
        if n_components == 0 || n_components > available {
            return Err(ScqcError::InsufficientComponents {
                stage: STAGE,
                requested: n_components,
                available,
            });
        }
        let mut dense = dense_cells_by_genes(ds, genes)?;
        center_columns(&mut dense, self.scale);
        let (u, d, _) = self.pca.run_pca(&dense.view(), n_components)?;
        let scores = &u * &d;
        info!(
            "pca: {} cells x {} genes -> {} components",
            ds.n_cells(),
            genes.len(),
            n_components
        );
        ds.clone().with_embedding(PCA_EMBEDDING, scores)
    }

    /// The first `n_dims` columns of embedding `source`
    fn leading_components<'a>(ds: &'a Dataset, source: &str, n_dims: usize) -> Result<ArrayView2<'a, f64>> {
        let Some(coords) = ds.embedding(source) else {
            return Err(ScqcError::StageOrder {
                stage: STAGE,
                reason: format!("embedding {source} has not been computed"),
            });
        };
        if n_dims == 0 || n_dims > coords.ncols() {
            return Err(ScqcError::InsufficientComponents {
                stage: STAGE,
                requested: n_dims,
                available: coords.ncols(),
            });
        }
        Ok(coords.slice(s![.., ..n_dims]))
    }

    /// Non-linear embedding of the first `n_dims` columns of `source`, stored under the
    /// embedding's own name
    pub fn run_embedding(&self, ds: &Dataset, source: &str, n_dims: usize) -> Result<Dataset> {
        let input = Self::leading_components(ds, source, n_dims)?;
        let coords = self.embedding.embed(&input)?;
        if coords.nrows() != ds.n_cells() {
            return Err(ScqcError::shape(STAGE, "embedding rows", ds.n_cells(), coords.nrows()));
        }
        info!(
            "{}: {} cells from {} dims of {}",
            self.embedding.name(),
            ds.n_cells(),
            n_dims,
            source
        );
        ds.clone().with_embedding(self.embedding.name(), coords)
    }

    /// Cluster cells on the first `n_dims` columns of `source`
    pub fn run_clustering(&self, ds: &Dataset, source: &str, n_dims: usize) -> Result<Dataset> {
        let input = Self::leading_components(ds, source, n_dims)?;
        let labels = self.clusterer.cluster(&input)?;
        ds.clone().with_clusters(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dim_red::RandSvd;
    use scqc_types::{CellMetadata, Conditions, GeneMetadata};
    use sprs::TriMat;

    struct FirstColumns;
    impl NonLinearEmbedding for FirstColumns {
        fn name(&self) -> &str {
            "first"
        }
        fn embed(&self, data: &ArrayView2<f64>) -> Result<Array2<f64>> {
            Ok(data.slice(s![.., ..1]).to_owned())
        }
    }

    struct SignOfFirst;
    impl GraphClusterer for SignOfFirst {
        fn cluster(&self, data: &ArrayView2<f64>) -> Result<Vec<u32>> {
            Ok(data.column(0).iter().map(|&x| u32::from(x > 0.0)).collect())
        }
    }

    /// Two groups of cells expressing disjoint gene sets, with a normalized layer
    fn two_groups() -> Dataset {
        let (n_genes, n_cells) = (6, 20);
        let mut counts = TriMat::new((n_genes, n_cells));
        let mut layer = TriMat::new((n_genes, n_cells));
        for c in 0..n_cells {
            let genes = if c < 10 { 0..3 } else { 3..6 };
            for g in genes {
                let v = 1 + ((c * 7 + g * 3) % 5) as u32;
                counts.add_triplet(g, c, v);
                layer.add_triplet(g, c, (v as f64).ln_1p());
            }
        }
        let ids: Vec<String> = (0..n_cells).map(|i| format!("c{i}")).collect();
        let cells = CellMetadata::new(
            ids.clone(),
            ids,
            Conditions::from_block_sizes(vec!["fresh".into()], &[n_cells]).unwrap(),
        );
        let names: Vec<String> = (0..n_genes).map(|i| format!("G{i}")).collect();
        let genes = GeneMetadata::new(names.clone(), names, vec!["Gene Expression".into(); n_genes]);
        Dataset::new(counts.to_csc(), cells, genes)
            .unwrap()
            .with_normalized(vec![1.0; n_cells], layer.to_csc())
            .unwrap()
    }

    #[test]
    fn wiring_attaches_results() {
        let ds = two_groups();
        let ec = EmbeddingAndClusterer::new(RandSvd::new(), FirstColumns, SignOfFirst);
        let genes: Vec<usize> = (0..6).collect();
        let ds = ec.run_pca(&ds, &genes, 3).unwrap();
        let pca = ds.embedding(PCA_EMBEDDING).unwrap();
        assert_eq!(pca.dim(), (20, 3));
        // the first component separates the groups
        let first = pca.column(0);
        assert!(first.iter().take(10).all(|&x| x * first[0] > 0.0));
        assert!(first.iter().skip(10).all(|&x| x * first[0] < 0.0));

        let ds = ec.run_embedding(&ds, PCA_EMBEDDING, 2).unwrap();
        assert_eq!(ds.embedding("first").unwrap().dim(), (20, 1));
        let ds = ec.run_clustering(&ds, PCA_EMBEDDING, 2).unwrap();
        let clusters = ds.clusters().unwrap();
        assert!(clusters[..10].iter().all(|&c| c == clusters[0]));
        assert!(clusters[10..].iter().all(|&c| c != clusters[0]));
    }

    #[test]
    fn dimension_checks() {
        let ds = two_groups();
        let ec = EmbeddingAndClusterer::new(RandSvd::new(), FirstColumns, SignOfFirst);
        assert!(matches!(
            ec.run_embedding(&ds, PCA_EMBEDDING, 2),
            Err(ScqcError::StageOrder { .. })
        ));
        let ds = ec.run_pca(&ds, &[0, 1, 2, 3, 4, 5], 4).unwrap();
        assert!(matches!(
            ec.run_embedding(&ds, PCA_EMBEDDING, 5),
            Err(ScqcError::InsufficientComponents {
                requested: 5,
                available: 4,
                ..
            })
        ));
        assert!(matches!(
            ec.run_pca(&ds, &[0, 1], 3),
            Err(ScqcError::InsufficientComponents { .. })
        ));
    }

    #[test]
    fn louvain_splits_groups() {
        let ds = two_groups();
        let ec = EmbeddingAndClusterer::new(RandSvd::new(), FirstColumns, LouvainClusterer {
            n_neighbors: 5,
            ..LouvainClusterer::default()
        });
        let ds = ec.run_pca(&ds, &[0, 1, 2, 3, 4, 5], 3).unwrap();
        let ds = ec.run_clustering(&ds, PCA_EMBEDDING, 3).unwrap();
        let clusters = ds.clusters().unwrap();
        for i in 0..10 {
            for j in 10..20 {
                assert_ne!(clusters[i], clusters[j]);
            }
        }
    }

    #[test]
    fn labels_ordered_by_size() {
        assert_eq!(relabel_by_size(&[7, 3, 3, 9, 3, 7]), vec![1, 0, 0, 2, 0, 1]);
    }
}
