//! In-memory dataset handed over by the loading code: graph, features, labels and seed splits.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::info;

use crate::{FeatureMatrix, GraphStore, NodeId, Result, SamplingError};

/// Train / validation / test seed sequences. Sequences are disjoint from one another; a
/// sequence may repeat an id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSplits {
    pub train: Vec<NodeId>,
    pub valid: Vec<NodeId>,
    pub test: Vec<NodeId>,
}

impl NodeSplits {
    pub fn new(train: Vec<NodeId>, valid: Vec<NodeId>, test: Vec<NodeId>) -> Self {
        Self { train, valid, test }
    }

    /// Checks that every id is a node of `graph` and that the three splits do not overlap.
    pub fn validate(&self, graph: &GraphStore) -> Result<()> {
        let splits = [
            ("train", &self.train),
            ("valid", &self.valid),
            ("test", &self.test),
        ];
        let mut owner: HashMap<NodeId, &str> = HashMap::new();
        for (name, ids) in splits {
            graph.check_nodes(ids)?;
            let unique: HashSet<NodeId> = ids.iter().copied().collect();
            for id in unique {
                if let Some(other) = owner.insert(id, name) {
                    return Err(SamplingError::InvalidConfig(format!(
                        "node {id} belongs to both the {other} and {name} splits"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Graph, per-node features and labels, and the seed splits, validated against each other.
#[derive(Debug, Clone)]
pub struct GraphDataset {
    graph: Arc<GraphStore>,
    features: FeatureMatrix,
    labels: Vec<i64>,
    splits: NodeSplits,
}

impl GraphDataset {
    pub fn new(
        graph: GraphStore,
        features: FeatureMatrix,
        labels: Vec<i64>,
        splits: NodeSplits,
    ) -> Result<Self> {
        let num_nodes = graph.num_nodes();
        if features.num_rows() != num_nodes {
            return Err(SamplingError::ShapeMismatch(format!(
                "{} feature rows for {num_nodes} nodes",
                features.num_rows()
            )));
        }
        if labels.len() != num_nodes {
            return Err(SamplingError::ShapeMismatch(format!(
                "{} labels for {num_nodes} nodes",
                labels.len()
            )));
        }
        splits.validate(&graph)?;
        info!(
            nodes = num_nodes,
            edges = graph.num_edges(),
            feature_dim = features.dim(),
            train = splits.train.len(),
            valid = splits.valid.len(),
            test = splits.test.len(),
            "loaded dataset"
        );
        Ok(Self {
            graph: Arc::new(graph),
            features,
            labels,
            splits,
        })
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn features(&self) -> &FeatureMatrix {
        &self.features
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn splits(&self) -> &NodeSplits {
        &self.splits
    }

    /// Labels of `nodes`, positionally.
    pub fn gather_labels(&self, nodes: &[NodeId]) -> Vec<i64> {
        nodes.iter().map(|&n| self.labels[n as usize]).collect()
    }

    /// Input features of `nodes`, positionally.
    pub fn gather_features(&self, nodes: &[NodeId]) -> FeatureMatrix {
        self.features.gather(nodes)
    }
}
