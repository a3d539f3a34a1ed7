//! Module containing the [`SamplingError`] type returned by the engine.

use crate::{EdgeId, NodeId};

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SamplingError>;

/// Errors raised while building graphs, validating configuration or producing minibatches.
///
/// Structural and configuration errors are raised eagerly, before any batch is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamplingError {
    /// An edge endpoint lies outside `[0, num_nodes)`.
    #[error("malformed graph: edge #{edge} ({src} -> {dst}) has an endpoint outside [0, {num_nodes})")]
    MalformedGraph {
        edge: EdgeId,
        src: NodeId,
        dst: NodeId,
        num_nodes: usize,
    },
    /// A seed node id lies outside `[0, num_nodes)`.
    #[error("node {node} is out of range for a graph with {num_nodes} nodes")]
    OutOfRangeNode { node: NodeId, num_nodes: usize },
    /// The fanout list does not describe the model, e.g. its length differs from the depth.
    #[error("invalid fanout specification: {0}")]
    InvalidFanoutSpec(String),
    /// An iterator or dataset option is out of its domain, e.g. a zero batch size.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A feature, label or layer output buffer disagrees with the shape it must have.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// A prefetch worker panicked while building a batch.
    #[error("prefetch worker panicked while building batch #{batch}: {message}")]
    WorkerPanicked { batch: usize, message: String },
}
