//! Sampled bipartite subgraphs ([`Block`]), their per-layer chaining ([`BlockChain`]) and the
//! per-step output of the minibatch iterator ([`MinibatchRecord`]).

use std::{collections::HashMap, ops::Range};

use anyhow::ensure;

use crate::{EdgeId, GraphStore, NodeId};

/// One layer's sampled bipartite subgraph.
///
/// `dst_nodes` is always a prefix of `src_nodes`: every destination is also a source, at the same
/// position, so a layer can read a destination's own previous-layer representation at
/// `src[i]` for `dst[i]`. Edges are stored positionally and grouped by destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    src_nodes: Vec<NodeId>,
    num_dst: usize,
    /// Per edge, position of its source in `src_nodes`.
    src_pos: Vec<usize>,
    /// Per edge, position of its destination in `dst_nodes`.
    dst_pos: Vec<usize>,
    edge_ids: Vec<EdgeId>,
    /// Length `num_dst + 1`; edges of destination `i` are `dst_offsets[i]..dst_offsets[i + 1]`.
    dst_offsets: Vec<usize>,
}

impl Block {
    pub(crate) fn from_parts(
        src_nodes: Vec<NodeId>,
        num_dst: usize,
        src_pos: Vec<usize>,
        dst_pos: Vec<usize>,
        edge_ids: Vec<EdgeId>,
        dst_offsets: Vec<usize>,
    ) -> Self {
        debug_assert!(num_dst <= src_nodes.len());
        debug_assert_eq!(src_pos.len(), dst_pos.len());
        debug_assert_eq!(src_pos.len(), edge_ids.len());
        debug_assert_eq!(dst_offsets.len(), num_dst + 1);
        Self {
            src_nodes,
            num_dst,
            src_pos,
            dst_pos,
            edge_ids,
            dst_offsets,
        }
    }

    pub fn src_nodes(&self) -> &[NodeId] {
        &self.src_nodes
    }

    pub fn dst_nodes(&self) -> &[NodeId] {
        &self.src_nodes[..self.num_dst]
    }

    pub fn num_src(&self) -> usize {
        self.src_nodes.len()
    }

    pub fn num_dst(&self) -> usize {
        self.num_dst
    }

    pub fn num_edges(&self) -> usize {
        self.edge_ids.len()
    }

    pub fn src_pos(&self) -> &[usize] {
        &self.src_pos
    }

    pub fn dst_pos(&self) -> &[usize] {
        &self.dst_pos
    }

    /// Graph edge id of every block edge.
    pub fn edge_ids(&self) -> &[EdgeId] {
        &self.edge_ids
    }

    /// Range of edge indices whose destination sits at position `dst`.
    pub fn in_edges(&self, dst: usize) -> Range<usize> {
        self.dst_offsets[dst]..self.dst_offsets[dst + 1]
    }

    /// Position of every destination in `src_nodes`; always `0..num_dst`.
    pub fn dst_in_src_positions(&self) -> Range<usize> {
        0..self.num_dst
    }

    /// Sampled in-degree of every destination, positionally.
    pub fn in_degrees(&self) -> Vec<usize> {
        self.dst_offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Edges as global `(src, dst)` node id pairs.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.src_pos
            .iter()
            .zip(&self.dst_pos)
            .map(|(&s, &d)| (self.src_nodes[s], self.src_nodes[d]))
    }

    /// Checks the block against the graph it was sampled from: unique sources, positions in
    /// range, edges grouped by destination and every edge present in `graph`.
    pub fn validate(&self, graph: &GraphStore) -> anyhow::Result<()> {
        let mut seen = HashMap::with_capacity(self.num_src());
        for (pos, &node) in self.src_nodes.iter().enumerate() {
            ensure!(graph.contains(node), "block node {node} is not in the graph");
            ensure!(
                seen.insert(node, pos).is_none(),
                "node {node} appears twice in src_nodes"
            );
        }
        ensure!(
            self.dst_offsets.first() == Some(&0)
                && self.dst_offsets.last() == Some(&self.num_edges()),
            "destination offsets do not span the edge list"
        );
        for dst in 0..self.num_dst {
            for edge in self.in_edges(dst) {
                ensure!(
                    self.dst_pos[edge] == dst,
                    "edge #{edge} is grouped under destination {dst} but points to {}",
                    self.dst_pos[edge]
                );
            }
        }
        for ((&s, &d), &eid) in self.src_pos.iter().zip(&self.dst_pos).zip(&self.edge_ids) {
            ensure!(
                s < self.num_src() && d < self.num_dst,
                "edge position ({s}, {d}) out of range"
            );
            let (u, v) = (self.src_nodes[s], self.src_nodes[d]);
            ensure!(
                graph.has_edge(u, v, eid),
                "edge #{eid} ({u} -> {v}) is not an edge of the graph"
            );
        }
        Ok(())
    }
}

/// The blocks of one minibatch, index 0 nearest the raw input features.
///
/// For every `i`, `blocks[i].dst_nodes() == blocks[i + 1].src_nodes()`, so the output rows of
/// layer `i` are, in order, the input rows of layer `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChain {
    blocks: Vec<Block>,
}

impl BlockChain {
    pub(crate) fn new(blocks: Vec<Block>) -> Self {
        debug_assert!(!blocks.is_empty());
        Self { blocks }
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn layer(&self, layer: usize) -> &Block {
        &self.blocks[layer]
    }

    /// Nodes whose raw features feed the first layer.
    pub fn input_nodes(&self) -> &[NodeId] {
        self.blocks[0].src_nodes()
    }

    /// Nodes whose representations the last layer produces.
    pub fn output_nodes(&self) -> &[NodeId] {
        self.blocks[self.blocks.len() - 1].dst_nodes()
    }

    /// Validates every block and the chain consistency between consecutive blocks.
    pub fn validate(&self, graph: &GraphStore) -> anyhow::Result<()> {
        for (layer, block) in self.blocks.iter().enumerate() {
            block
                .validate(graph)
                .map_err(|e| e.context(format!("invalid block at layer {layer}")))?;
        }
        for (layer, pair) in self.blocks.windows(2).enumerate() {
            ensure!(
                pair[0].dst_nodes() == pair[1].src_nodes(),
                "dst_nodes of layer {layer} differ from src_nodes of layer {}",
                layer + 1
            );
        }
        Ok(())
    }
}

/// What the iterator yields for one batch.
#[derive(Debug, Clone)]
pub struct MinibatchRecord {
    batch_index: usize,
    seeds: Vec<NodeId>,
    output_positions: Vec<usize>,
    block_chain: BlockChain,
}

impl MinibatchRecord {
    pub(crate) fn new(batch_index: usize, seeds: Vec<NodeId>, block_chain: BlockChain) -> Self {
        let rows: HashMap<NodeId, usize> = block_chain
            .output_nodes()
            .iter()
            .enumerate()
            .map(|(pos, &node)| (node, pos))
            .collect();
        let output_positions = seeds.iter().map(|seed| rows[seed]).collect();
        Self {
            batch_index,
            seeds,
            output_positions,
            block_chain,
        }
    }

    /// Position of this batch within its epoch.
    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    /// Seed ids of the batch as they appeared in the (possibly shuffled) seed sequence.
    pub fn seeds(&self) -> &[NodeId] {
        &self.seeds
    }

    /// For every entry of [`MinibatchRecord::seeds`], its row in the output of the last layer.
    /// Identity when the batch has no duplicate seeds.
    pub fn output_positions(&self) -> &[usize] {
        &self.output_positions
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        self.block_chain.input_nodes()
    }

    pub fn output_nodes(&self) -> &[NodeId] {
        self.block_chain.output_nodes()
    }

    pub fn block_chain(&self) -> &BlockChain {
        &self.block_chain
    }

    /// Splits the record into `(input_nodes, output_nodes, block_chain)`.
    pub fn into_parts(self) -> (Vec<NodeId>, Vec<NodeId>, BlockChain) {
        let input_nodes = self.block_chain.input_nodes().to_vec();
        let output_nodes = self.block_chain.output_nodes().to_vec();
        (input_nodes, output_nodes, self.block_chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::worked_example_graph;

    /// Destinations `[8, 4]`; edges 4->8, 5->8, 0->4 of the example graph.
    fn small_block() -> Block {
        Block::from_parts(
            vec![8, 4, 5, 0],
            2,
            vec![1, 2, 3],
            vec![0, 0, 1],
            vec![8, 9, 0],
            vec![0, 2, 3],
        )
    }

    #[test]
    fn test_accessors() -> anyhow::Result<()> {
        let block = small_block();
        block.validate(&worked_example_graph())?;
        assert_eq!(block.dst_nodes(), &[8, 4]);
        assert_eq!(block.dst_in_src_positions(), 0..2);
        assert_eq!(block.in_degrees(), vec![2, 1]);
        assert_eq!(block.in_edges(1), 2..3);
        assert_eq!(block.edges().collect::<Vec<_>>(), vec![(4, 8), (5, 8), (0, 4)]);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_foreign_edge() {
        // 1 -> 8 is not an edge of the graph
        let block = Block::from_parts(vec![8, 1], 1, vec![1], vec![0], vec![8], vec![0, 1]);
        let err = block.validate(&worked_example_graph()).unwrap_err();
        assert!(err.to_string().contains("not an edge"));
    }

    #[test]
    fn test_chain_consistency_is_checked() {
        let graph = worked_example_graph();
        let inner = Block::from_parts(vec![4, 5, 0], 2, vec![2], vec![0], vec![0], vec![0, 1, 1]);
        let chain = BlockChain::new(vec![inner, small_block()]);
        let err = chain.validate(&graph).unwrap_err();
        assert!(err.to_string().contains("differ"));
    }

    #[test]
    fn test_record_output_positions() {
        let chain = BlockChain::new(vec![small_block()]);
        let record = MinibatchRecord::new(3, vec![4, 8, 4], chain);
        assert_eq!(record.batch_index(), 3);
        assert_eq!(record.output_positions(), &[1, 0, 1]);
        assert_eq!(record.input_nodes(), &[8, 4, 5, 0]);
    }
}
