//! Construction of a single layer's [`Block`] from a destination set.

use std::collections::{hash_map::Entry, HashMap};

use rand::Rng;
use tracing::trace;

use crate::{block::Block, EdgeId, Fanout, GraphStore, NeighborSampler, NodeId};

/// Builds one block: the destination set, the sampled in-edges of every destination and the
/// union of their sources.
pub struct FrontierBuilder<'a, S> {
    graph: &'a GraphStore,
    sampler: &'a S,
}

impl<'a, S: NeighborSampler> FrontierBuilder<'a, S> {
    pub fn new(graph: &'a GraphStore, sampler: &'a S) -> Self {
        Self { graph, sampler }
    }

    /// Samples the in-edges of every node of `dst_set` with the given fanout.
    ///
    /// `dst_set` is deduplicated keeping first occurrences. The resulting `src_nodes` starts with
    /// the deduplicated destinations, followed by sampled sources in order of first appearance.
    /// All ids must be nodes of the graph.
    pub fn build<R: Rng + ?Sized>(&self, dst_set: &[NodeId], fanout: Fanout, rng: &mut R) -> Block {
        let mut positions: HashMap<NodeId, usize> = HashMap::with_capacity(dst_set.len() * 2);
        let mut src_nodes = Vec::with_capacity(dst_set.len() * 2);
        for &v in dst_set {
            if let Entry::Vacant(entry) = positions.entry(v) {
                entry.insert(src_nodes.len());
                src_nodes.push(v);
            }
        }
        let num_dst = src_nodes.len();

        let mut sampled: Vec<(NodeId, EdgeId)> = Vec::new();
        let mut src_pos = Vec::new();
        let mut dst_pos = Vec::new();
        let mut edge_ids = Vec::new();
        let mut dst_offsets = Vec::with_capacity(num_dst + 1);
        dst_offsets.push(0);
        for dst in 0..num_dst {
            let v = src_nodes[dst];
            sampled.clear();
            self.sampler
                .sample_edges(self.graph, v, fanout, rng, &mut sampled);
            for &(u, eid) in &sampled {
                let pos = match positions.entry(u) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => {
                        src_nodes.push(u);
                        *entry.insert(src_nodes.len() - 1)
                    }
                };
                src_pos.push(pos);
                dst_pos.push(dst);
                edge_ids.push(eid);
            }
            dst_offsets.push(edge_ids.len());
        }

        trace!(
            num_dst,
            num_src = src_nodes.len(),
            num_edges = edge_ids.len(),
            %fanout,
            "built frontier"
        );
        Block::from_parts(src_nodes, num_dst, src_pos, dst_pos, edge_ids, dst_offsets)
    }
}
