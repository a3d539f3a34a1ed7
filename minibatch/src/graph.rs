//! Immutable directed graph with O(1) in-neighbor lookup.
//!
//! Edges are stored grouped by destination (an in-edge CSR): `offsets[v]..offsets[v + 1]` is the
//! range of `sources` / `edge_ids` holding the edges `(u, v)`. Within a destination, edges keep
//! the order in which they were supplied at construction.

use tracing::debug;

use crate::{EdgeId, NodeId, Result, SamplingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStore {
    num_nodes: usize,
    /// Length `num_nodes + 1`.
    offsets: Vec<usize>,
    sources: Vec<NodeId>,
    /// Aligned with `sources`: the id of the edge each source entry comes from.
    edge_ids: Vec<EdgeId>,
}

impl GraphStore {
    /// Builds the graph from a node count and a `(src, dst)` edge list. The position of an edge
    /// in `edges` becomes its [`EdgeId`].
    pub fn from_edges(num_nodes: usize, edges: &[(NodeId, NodeId)]) -> Result<Self> {
        if num_nodes > NodeId::MAX as usize + 1 {
            return Err(SamplingError::InvalidConfig(format!(
                "graph with {num_nodes} nodes cannot be addressed with {}-bit node ids",
                NodeId::BITS
            )));
        }
        let mut in_degrees = vec![0usize; num_nodes];
        for (edge, &(src, dst)) in edges.iter().enumerate() {
            if src as usize >= num_nodes || dst as usize >= num_nodes {
                return Err(SamplingError::MalformedGraph {
                    edge,
                    src,
                    dst,
                    num_nodes,
                });
            }
            in_degrees[dst as usize] += 1;
        }

        let mut offsets = Vec::with_capacity(num_nodes + 1);
        let mut acc = 0;
        offsets.push(acc);
        for degree in in_degrees {
            acc += degree;
            offsets.push(acc);
        }

        // counting sort by destination, stable in edge order
        let mut cursors = offsets[..num_nodes].to_vec();
        let mut sources = vec![0; edges.len()];
        let mut edge_ids = vec![0; edges.len()];
        for (edge, &(src, dst)) in edges.iter().enumerate() {
            let pos = cursors[dst as usize];
            sources[pos] = src;
            edge_ids[pos] = edge;
            cursors[dst as usize] += 1;
        }

        debug!(
            "built graph: {} nodes, {} edges",
            utils::separated(num_nodes),
            utils::separated(edges.len())
        );
        Ok(Self {
            num_nodes,
            offsets,
            sources,
            edge_ids,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.sources.len()
    }

    /// All `u` such that the edge `(u, v)` exists, in construction order. A node with parallel
    /// edges from the same source appears once per edge.
    ///
    /// Panics if `v` is not a node of the graph; callers validate ids up front.
    pub fn in_neighbors(&self, v: NodeId) -> &[NodeId] {
        &self.sources[self.range(v)]
    }

    /// Edge ids aligned with [`GraphStore::in_neighbors`].
    pub fn in_edge_ids(&self, v: NodeId) -> &[EdgeId] {
        &self.edge_ids[self.range(v)]
    }

    pub fn in_degree(&self, v: NodeId) -> usize {
        let v = v as usize;
        self.offsets[v + 1] - self.offsets[v]
    }

    pub fn contains(&self, v: NodeId) -> bool {
        (v as usize) < self.num_nodes
    }

    /// Returns [`SamplingError::OutOfRangeNode`] if `v` is not a node of the graph.
    pub fn check_node(&self, v: NodeId) -> Result<()> {
        if self.contains(v) {
            Ok(())
        } else {
            Err(SamplingError::OutOfRangeNode {
                node: v,
                num_nodes: self.num_nodes,
            })
        }
    }

    /// Validates every id of `nodes`, failing on the first out-of-range one.
    pub fn check_nodes(&self, nodes: &[NodeId]) -> Result<()> {
        nodes.iter().try_for_each(|&v| self.check_node(v))
    }

    /// Whether edge `eid` is an edge `(u, v)` of the graph.
    pub fn has_edge(&self, u: NodeId, v: NodeId, eid: EdgeId) -> bool {
        self.contains(u)
            && self.contains(v)
            && self
                .in_neighbors(v)
                .iter()
                .zip(self.in_edge_ids(v))
                .any(|(&src, &id)| src == u && id == eid)
    }

    /// Approximate heap footprint of the adjacency arrays.
    pub fn memory_size(&self) -> usize {
        self.offsets.len() * std::mem::size_of::<usize>()
            + self.sources.len() * std::mem::size_of::<NodeId>()
            + self.edge_ids.len() * std::mem::size_of::<EdgeId>()
    }

    fn range(&self, v: NodeId) -> std::ops::Range<usize> {
        let v = v as usize;
        self.offsets[v]..self.offsets[v + 1]
    }
}
