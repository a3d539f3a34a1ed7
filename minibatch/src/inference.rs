//! Whole-graph inference, one layer at a time.
//!
//! Running the training-style sampler over every node would recompute each node's L-hop
//! dependency tree once per output node. Instead the driver iterates layers in the outer loop and
//! contiguous node batches in the inner loop: for layer `l` every node is the destination of
//! exactly one single-layer, unbounded-fanout block, and its output row is written once into a
//! `[N, dim_l]` buffer. The finished buffer is moved into the next layer as its input and the
//! previous one is dropped.
//!
//! Batches of one layer write disjoint row ranges of the output buffer, so they run in parallel
//! on the rayon pool.

use std::sync::Arc;

use anyhow::{ensure, Context};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::{
    Block, Fanout, FeatureMatrix, FrontierBuilder, GraphStore, NodeId, Result, SamplingError,
    UniformNeighborSampler,
};

/// One message-passing layer, supplied by the model.
pub trait GnnLayer: Send + Sync {
    /// Width of the rows returned by [`GnnLayer::forward`].
    fn output_dim(&self) -> usize;

    /// Computes the outputs of `block`'s destination nodes. `src_features` holds one row per
    /// entry of `block.src_nodes()`, positionally; the result must have `block.num_dst()` rows of
    /// [`GnnLayer::output_dim`] values.
    fn forward(&self, block: &Block, src_features: &FeatureMatrix) -> anyhow::Result<FeatureMatrix>;
}

impl<L: GnnLayer + ?Sized> GnnLayer for &L {
    fn output_dim(&self) -> usize {
        (**self).output_dim()
    }

    fn forward(&self, block: &Block, src_features: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
        (**self).forward(block, src_features)
    }
}

impl<L: GnnLayer + ?Sized> GnnLayer for Box<L> {
    fn output_dim(&self) -> usize {
        (**self).output_dim()
    }

    fn forward(&self, block: &Block, src_features: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
        (**self).forward(block, src_features)
    }
}

#[derive(Debug, Clone)]
pub struct LayerwiseInferenceDriver {
    graph: Arc<GraphStore>,
    batch_size: usize,
}

impl LayerwiseInferenceDriver {
    /// A `batch_size` larger than the graph is clamped to a single batch covering every node.
    pub fn new(graph: Arc<GraphStore>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(SamplingError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        let batch_size = batch_size.min(graph.num_nodes().max(1));
        Ok(Self { graph, batch_size })
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of node batches per layer.
    pub fn num_batches(&self) -> usize {
        self.graph.num_nodes().div_ceil(self.batch_size)
    }

    /// Node ids of batch `batch`: a contiguous slice of `[0, N)`.
    fn batch_nodes(&self, batch: usize) -> Vec<NodeId> {
        let start = batch * self.batch_size;
        let end = (start + self.batch_size).min(self.graph.num_nodes());
        (start..end).map(|v| v as NodeId).collect()
    }

    /// Applies `layers` in order to `features` (`[N, F]`) and returns the last layer's outputs.
    ///
    /// `features` is consumed; every intermediate buffer is released as soon as the next layer
    /// has been computed. With no layers the input is returned unchanged.
    #[instrument(name = "LayerwiseInferenceDriver::infer", skip_all, fields(num_layers = layers.len()))]
    pub fn infer<L: GnnLayer>(
        &self,
        layers: &[L],
        features: FeatureMatrix,
    ) -> anyhow::Result<FeatureMatrix> {
        let num_nodes = self.graph.num_nodes();
        ensure!(
            features.num_rows() == num_nodes,
            SamplingError::ShapeMismatch(format!(
                "{} input feature rows for {num_nodes} nodes",
                features.num_rows()
            ))
        );
        let mut buffer = features;
        for (index, layer) in layers.iter().enumerate() {
            buffer = self
                .infer_layer(index, layer, &buffer)
                .with_context(|| format!("layer-wise inference failed at layer {index}"))?;
            info!(
                layer = index,
                dim = buffer.dim(),
                size = %utils::human_bytes(buffer.memory_size()),
                "computed layer outputs"
            );
            utils::log_memory(&format!("after layer {index}"));
        }
        Ok(buffer)
    }

    /// Computes the `[N, output_dim]` outputs of one layer from the previous layer's buffer.
    #[instrument(name = "LayerwiseInferenceDriver::infer_layer", skip_all, level = "debug", fields(layer = index))]
    fn infer_layer<L: GnnLayer + ?Sized>(
        &self,
        index: usize,
        layer: &L,
        input: &FeatureMatrix,
    ) -> anyhow::Result<FeatureMatrix> {
        let out_dim = layer.output_dim();
        ensure!(
            out_dim > 0,
            SamplingError::ShapeMismatch(format!("layer {index} has an empty output width"))
        );
        let num_values = self.graph.num_nodes().checked_mul(out_dim);
        let chunk_len = self.batch_size.checked_mul(out_dim);
        let (Some(_), Some(chunk_len)) = (num_values, chunk_len) else {
            return Err(SamplingError::InvalidConfig(format!(
                "layer {index} output of {} x {out_dim} values overflows usize",
                self.graph.num_nodes()
            ))
            .into());
        };
        let sampler = UniformNeighborSampler;
        let builder = FrontierBuilder::new(&self.graph, &sampler);
        let mut output = FeatureMatrix::zeros(self.graph.num_nodes(), out_dim);
        output
            .as_mut_slice()
            .par_chunks_mut(chunk_len)
            .enumerate()
            .try_for_each(|(batch, rows)| -> anyhow::Result<()> {
                let nodes = self.batch_nodes(batch);
                // unbounded fanout never draws from the rng
                let mut rng = ChaCha8Rng::seed_from_u64(0);
                let block = builder.build(&nodes, Fanout::Unbounded, &mut rng);
                let src_features = input.gather(block.src_nodes());
                let out = layer
                    .forward(&block, &src_features)
                    .with_context(|| format!("forward failed on batch {batch}"))?;
                ensure!(
                    out.num_rows() == nodes.len() && out.dim() == out_dim,
                    SamplingError::ShapeMismatch(format!(
                        "layer {index} returned [{}, {}] for batch {batch}, expected [{}, {out_dim}]",
                        out.num_rows(),
                        out.dim(),
                        nodes.len()
                    ))
                );
                rows.copy_from_slice(out.as_slice());
                Ok(())
            })?;
        debug!(batches = self.num_batches(), "filled layer buffer");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        testing::{random_features, random_graph, worked_example_graph, MeanAggregationLayer},
        BlockChainAssembler, FanoutSpec,
    };
    use rstest::rstest;

    fn layers(dims: &[usize]) -> Vec<Box<dyn GnnLayer>> {
        dims.windows(2)
            .enumerate()
            .map(|(i, w)| {
                Box::new(MeanAggregationLayer::random(w[0], w[1], i as u64)) as Box<dyn GnnLayer>
            })
            .collect()
    }

    /// Records the destination nodes of every block it is applied to.
    struct RecordingLayer {
        seen: std::sync::Mutex<Vec<NodeId>>,
    }

    impl GnnLayer for RecordingLayer {
        fn output_dim(&self) -> usize {
            1
        }

        fn forward(&self, block: &Block, _: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
            self.seen.lock().unwrap().extend_from_slice(block.dst_nodes());
            Ok(FeatureMatrix::new(
                block.num_dst(),
                1,
                block.dst_nodes().iter().map(|&v| v as f32).collect(),
            )?)
        }
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(12)]
    #[case(100)]
    fn test_every_node_computed_once(#[case] batch_size: usize) -> anyhow::Result<()> {
        let graph = Arc::new(worked_example_graph());
        let driver = LayerwiseInferenceDriver::new(graph, batch_size)?;
        let layer = RecordingLayer {
            seen: Default::default(),
        };
        let output = driver.infer(&[&layer as &dyn GnnLayer], FeatureMatrix::zeros(12, 3))?;

        let mut seen = layer.seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<NodeId>>());
        // each row was written at the position of its own node
        assert_eq!(output.as_slice(), (0..12).map(|v| v as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[rstest]
    #[case(7, &[4, 8, 3])]
    #[case(64, &[6, 6])]
    fn test_matches_full_fanout_block_chains(
        #[case] batch_size: usize,
        #[case] dims: &[usize],
    ) -> anyhow::Result<()> {
        let graph = Arc::new(random_graph(120, 3.0, 11));
        let features = random_features(120, dims[0], 2);
        let layers = layers(dims);
        let driver = LayerwiseInferenceDriver::new(graph.clone(), batch_size)?;
        let layerwise = driver.infer(&layers, features.clone())?;
        assert_eq!(layerwise.num_rows(), 120);
        assert_eq!(layerwise.dim(), *dims.last().unwrap());

        let num_layers = layers.len();
        let assembler = BlockChainAssembler::new(
            graph,
            UniformNeighborSampler,
            FanoutSpec::full(num_layers)?,
            num_layers,
        )?;
        let seeds: Vec<NodeId> = vec![0, 17, 42, 99, 119];
        let chain = assembler.assemble(&seeds, &mut ChaCha8Rng::seed_from_u64(5))?;
        let mut hidden = features.gather(chain.input_nodes());
        for (block, layer) in chain.blocks().iter().zip(&layers) {
            hidden = layer.forward(block, &hidden)?;
        }
        let rows: HashMap<NodeId, usize> = chain
            .output_nodes()
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i))
            .collect();
        for &seed in &seeds {
            let expected = layerwise.row(seed as usize);
            let actual = hidden.row(rows[&seed]);
            for (a, e) in actual.iter().zip(expected) {
                assert!((a - e).abs() < 1e-5, "node {seed}: {a} != {e}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_no_layers_returns_input() -> anyhow::Result<()> {
        let driver = LayerwiseInferenceDriver::new(Arc::new(worked_example_graph()), 4)?;
        let features = random_features(12, 2, 0);
        let layers: Vec<Box<dyn GnnLayer>> = Vec::new();
        assert_eq!(driver.infer(&layers, features.clone())?, features);
        Ok(())
    }

    #[test]
    fn test_input_rows_must_match_graph() -> anyhow::Result<()> {
        let driver = LayerwiseInferenceDriver::new(Arc::new(worked_example_graph()), 4)?;
        let err = driver
            .infer(&layers(&[2, 2]), random_features(11, 2, 0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SamplingError>(),
            Some(SamplingError::ShapeMismatch(_))
        ));
        Ok(())
    }

    /// Claims one output width but returns another.
    struct WrongWidthLayer;

    impl GnnLayer for WrongWidthLayer {
        fn output_dim(&self) -> usize {
            4
        }

        fn forward(&self, block: &Block, _: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
            Ok(FeatureMatrix::zeros(block.num_dst(), 2))
        }
    }

    #[test]
    fn test_layer_output_shape_is_checked() -> anyhow::Result<()> {
        let driver = LayerwiseInferenceDriver::new(Arc::new(worked_example_graph()), 5)?;
        let err = driver
            .infer(&[&WrongWidthLayer as &dyn GnnLayer], FeatureMatrix::zeros(12, 1))
            .unwrap_err();
        assert!(err.to_string().contains("layer 0"));
        assert!(err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<SamplingError>(), Some(SamplingError::ShapeMismatch(_)))));
        Ok(())
    }

    #[test]
    fn test_oversized_batch_covers_whole_graph() -> anyhow::Result<()> {
        let graph = Arc::new(worked_example_graph());
        let driver = LayerwiseInferenceDriver::new(graph.clone(), usize::MAX)?;
        assert_eq!(driver.batch_size(), 12);
        assert_eq!(driver.num_batches(), 1);

        let layers = [MeanAggregationLayer::random(2, 3, 0)];
        let features = random_features(12, 2, 0);
        let single = driver.infer(&layers, features.clone())?;
        let batched = LayerwiseInferenceDriver::new(graph, 5)?.infer(&layers, features)?;
        assert_eq!((single.num_rows(), single.dim()), (12, 3));
        for (a, b) in single.as_slice().iter().zip(batched.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    /// Reports an output width too large to allocate.
    struct HugeWidthLayer;

    impl GnnLayer for HugeWidthLayer {
        fn output_dim(&self) -> usize {
            usize::MAX / 2
        }

        fn forward(&self, _: &Block, _: &FeatureMatrix) -> anyhow::Result<FeatureMatrix> {
            unreachable!("rejected before any batch runs")
        }
    }

    #[test]
    fn test_overflowing_output_width_is_rejected() -> anyhow::Result<()> {
        let driver = LayerwiseInferenceDriver::new(Arc::new(worked_example_graph()), 4)?;
        let err = driver
            .infer(&[HugeWidthLayer], FeatureMatrix::zeros(12, 1))
            .unwrap_err();
        assert!(err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<SamplingError>(), Some(SamplingError::InvalidConfig(_)))));
        Ok(())
    }

    #[test]
    fn test_zero_batch_size() {
        assert!(matches!(
            LayerwiseInferenceDriver::new(Arc::new(worked_example_graph()), 0),
            Err(SamplingError::InvalidConfig(_))
        ));
    }
}
