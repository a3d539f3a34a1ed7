//! Neighbor-sampled minibatch construction for graph neural network training.
//!
//! The crate turns an L-layer message-passing computation over a graph that does not fit in
//! memory into small, self-contained [`BlockChain`]s. Each chain is built backward from a batch
//! of seed nodes: the outermost [`Block`] has the seeds as destinations, and every shallower
//! block has the previous block's sources as destinations, until the raw input nodes are
//! reached. The [`MinibatchIterator`] drives this per batch, optionally on prefetch workers, and
//! the [`LayerwiseInferenceDriver`] computes full-graph outputs one layer at a time.

pub mod assembler;
pub mod block;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod frontier;
pub mod graph;
pub mod inference;
pub mod loader;
pub mod sampler;
pub mod testing;

pub use assembler::BlockChainAssembler;
pub use block::{Block, BlockChain, MinibatchRecord};
pub use config::{BatchOptions, LoaderConfig};
pub use dataset::{GraphDataset, NodeSplits};
pub use error::{Result, SamplingError};
pub use features::FeatureMatrix;
pub use frontier::FrontierBuilder;
pub use graph::GraphStore;
pub use inference::{GnnLayer, LayerwiseInferenceDriver};
pub use loader::{Epoch, MinibatchIterator};
pub use sampler::{Fanout, FanoutSpec, NeighborSampler, UniformNeighborSampler};

/// Identifier of a node, in `[0, num_nodes)`.
pub type NodeId = u32;

/// Identifier of an edge: its position in the edge list the graph was built from.
pub type EdgeId = usize;
