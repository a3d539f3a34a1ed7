//! Graphs, features and a reference layer for tests and benchmarks.

use anyhow::ensure;
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{Block, FeatureMatrix, GnnLayer, GraphStore, NodeId};

/// Edges of the 12-node example graph, in construction order.
pub fn worked_example_edges() -> Vec<(NodeId, NodeId)> {
    vec![
        (0, 4),
        (1, 4),
        (2, 5),
        (3, 5),
        (6, 7),
        (9, 7),
        (10, 11),
        (11, 11),
        (4, 8),
        (5, 8),
        (7, 8),
        (11, 8),
    ]
}

pub fn worked_example_graph() -> GraphStore {
    GraphStore::from_edges(12, &worked_example_edges()).expect("example graph is well formed")
}

/// Random directed multigraph with `num_nodes` nodes and about `avg_degree` in-edges per node.
pub fn random_graph(num_nodes: usize, avg_degree: f64, seed: u64) -> GraphStore {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let num_edges = if num_nodes == 0 {
        0
    } else {
        (num_nodes as f64 * avg_degree).round() as usize
    };
    let edges = (0..num_edges)
        .map(|_| {
            (
                rng.gen_range(0..num_nodes) as NodeId,
                rng.gen_range(0..num_nodes) as NodeId,
            )
        })
        .collect_vec();
    GraphStore::from_edges(num_nodes, &edges).expect("random graph is well formed")
}

pub fn random_features(num_rows: usize, dim: usize, seed: u64) -> FeatureMatrix {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data = (0..num_rows * dim)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect_vec();
    FeatureMatrix::new(num_rows, dim, data).expect("length matches shape")
}

/// `out[v] = (h[v] + mean(h[u] for u -> v)) * W`, with `W` of shape `[in_dim, out_dim]`.
///
/// Neighbor contributions are summed in block edge order, so two blocks listing the same
/// in-edges of a node produce bitwise identical rows.
#[derive(Debug, Clone)]
pub struct MeanAggregationLayer {
    in_dim: usize,
    out_dim: usize,
    weights: Vec<f32>,
}

impl MeanAggregationLayer {
    pub fn random(in_dim: usize, out_dim: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let weights = (0..in_dim * out_dim)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect_vec();
        Self {
            in_dim,
            out_dim,
            weights,
        }
    }
}

impl GnnLayer for MeanAggregationLayer {
    fn output_dim(&self) -> usize {
        self.out_dim
    }

    fn forward(&self, block: &Block, src_features: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
        ensure!(
            src_features.dim() == self.in_dim,
            "expected {} input features per row, got {}",
            self.in_dim,
            src_features.dim()
        );
        ensure!(
            src_features.num_rows() == block.num_src(),
            "expected one feature row per source node ({}), got {}",
            block.num_src(),
            src_features.num_rows()
        );
        let mut out = vec![0.0; block.num_dst() * self.out_dim];
        let mut hidden = vec![0.0f32; self.in_dim];
        let mut neighbors = vec![0.0f32; self.in_dim];
        for dst in 0..block.num_dst() {
            hidden.copy_from_slice(src_features.row(dst));
            let edges = block.in_edges(dst);
            let degree = edges.len();
            if degree > 0 {
                neighbors.fill(0.0);
                for e in edges {
                    let row = src_features.row(block.src_pos()[e]);
                    neighbors.iter_mut().zip(row).for_each(|(acc, x)| *acc += x);
                }
                hidden
                    .iter_mut()
                    .zip(&neighbors)
                    .for_each(|(h, n)| *h += n / degree as f32);
            }
            let row = &mut out[dst * self.out_dim..(dst + 1) * self.out_dim];
            for (i, h) in hidden.iter().enumerate() {
                let weights = &self.weights[i * self.out_dim..(i + 1) * self.out_dim];
                row.iter_mut().zip(weights).for_each(|(o, w)| *o += h * w);
            }
        }
        Ok(FeatureMatrix::new(block.num_dst(), self.out_dim, out)?)
    }
}
