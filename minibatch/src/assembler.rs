//! Backward construction of a [`BlockChain`] from a batch of seed nodes.
//!
//! Computing a seed's layer-L output needs the layer-(L-1) outputs of its sampled in-neighbors,
//! which need layer-(L-2) outputs of theirs, and so on down to raw features. The assembler
//! therefore samples from the outermost layer inward: the seeds are the destinations of the last
//! block and each block's sources become the destinations of the block below it. Only one
//! frontier is live at a time.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, instrument};

use crate::{
    block::{Block, BlockChain},
    FanoutSpec, FrontierBuilder, GraphStore, NeighborSampler, NodeId, Result,
    UniformNeighborSampler,
};

#[derive(Debug, Clone)]
pub struct BlockChainAssembler<S = UniformNeighborSampler> {
    graph: Arc<GraphStore>,
    sampler: S,
    fanouts: FanoutSpec,
}

impl<S: NeighborSampler> BlockChainAssembler<S> {
    /// Creates an assembler for a model of `num_layers` layers. Fails with
    /// [`crate::SamplingError::InvalidFanoutSpec`] unless there is exactly one fanout per layer.
    pub fn new(
        graph: Arc<GraphStore>,
        sampler: S,
        fanouts: FanoutSpec,
        num_layers: usize,
    ) -> Result<Self> {
        fanouts.check_depth(num_layers)?;
        Ok(Self {
            graph,
            sampler,
            fanouts,
        })
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn fanouts(&self) -> &FanoutSpec {
        &self.fanouts
    }

    pub fn num_layers(&self) -> usize {
        self.fanouts.num_layers()
    }

    /// Builds the block chain of `seeds`. The last block's `dst_nodes` are the seeds in order
    /// (duplicates removed); the first block's `src_nodes` are the input nodes.
    #[instrument(name = "BlockChainAssembler::assemble", skip_all, level = "debug", fields(num_seeds = seeds.len()))]
    pub fn assemble<R: Rng + ?Sized>(&self, seeds: &[NodeId], rng: &mut R) -> Result<BlockChain> {
        self.graph.check_nodes(seeds)?;
        Ok(self.assemble_unchecked(seeds, rng))
    }

    /// Same as [`BlockChainAssembler::assemble`] for seeds already validated against the graph.
    pub(crate) fn assemble_unchecked<R: Rng + ?Sized>(
        &self,
        seeds: &[NodeId],
        rng: &mut R,
    ) -> BlockChain {
        let builder = FrontierBuilder::new(&self.graph, &self.sampler);
        let mut blocks: Vec<Block> = Vec::with_capacity(self.num_layers());
        for layer in (0..self.num_layers()).rev() {
            let dst = blocks.last().map_or(seeds, |outer| outer.src_nodes());
            let block = builder.build(dst, self.fanouts.layer(layer), rng);
            blocks.push(block);
        }
        blocks.reverse();
        let chain = BlockChain::new(blocks);
        debug!(
            input_nodes = chain.input_nodes().len(),
            output_nodes = chain.output_nodes().len(),
            "assembled block chain"
        );
        chain
    }
}
