//! Per-layer fanout bounds and the [`NeighborSampler`] policy used to pick in-edges.

use std::{fmt, str::FromStr};

use itertools::Itertools;
use rand::{seq::index, Rng};
use serde::{Deserialize, Serialize};

use crate::{EdgeId, GraphStore, NodeId, Result, SamplingError};

/// Maximum number of in-neighbors sampled per destination node at one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(try_from = "FanoutRepr", into = "FanoutRepr")]
pub enum Fanout {
    /// At most `k` in-neighbors, uniformly without replacement.
    #[display("{_0}")]
    Bounded(usize),
    /// Every in-neighbor.
    #[display("all")]
    Unbounded,
}

impl Fanout {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Fanout::Unbounded)
    }

    /// Number of in-neighbors kept for a destination of degree `in_degree`.
    pub fn bound(&self, in_degree: usize) -> usize {
        match self {
            Fanout::Bounded(k) => in_degree.min(*k),
            Fanout::Unbounded => in_degree,
        }
    }
}

impl FromStr for Fanout {
    type Err = SamplingError;

    /// Accepts a positive integer, or `all` / `full` / `-1` for an unbounded fanout.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "all" | "full" | "-1" => Ok(Fanout::Unbounded),
            other => match other.parse::<usize>() {
                Ok(0) | Err(_) => Err(SamplingError::InvalidFanoutSpec(format!(
                    "fanout must be a positive integer or 'all', got {other:?}"
                ))),
                Ok(k) => Ok(Fanout::Bounded(k)),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FanoutRepr {
    Count(i64),
    Keyword(String),
}

impl TryFrom<FanoutRepr> for Fanout {
    type Error = SamplingError;

    fn try_from(repr: FanoutRepr) -> Result<Self> {
        match repr {
            FanoutRepr::Count(-1) => Ok(Fanout::Unbounded),
            FanoutRepr::Count(k) if k > 0 => Ok(Fanout::Bounded(k as usize)),
            FanoutRepr::Count(k) => Err(SamplingError::InvalidFanoutSpec(format!(
                "fanout must be positive or -1 for unbounded, got {k}"
            ))),
            FanoutRepr::Keyword(s) => s.parse(),
        }
    }
}

impl From<Fanout> for FanoutRepr {
    fn from(fanout: Fanout) -> Self {
        match fanout {
            Fanout::Bounded(k) => FanoutRepr::Count(k as i64),
            Fanout::Unbounded => FanoutRepr::Keyword("all".to_string()),
        }
    }
}

/// One [`Fanout`] per model layer, index 0 being the layer nearest the raw input features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Fanout>", into = "Vec<Fanout>")]
pub struct FanoutSpec(Vec<Fanout>);

impl FanoutSpec {
    pub fn new(fanouts: Vec<Fanout>) -> Result<Self> {
        if fanouts.is_empty() {
            return Err(SamplingError::InvalidFanoutSpec(
                "at least one layer is required".to_string(),
            ));
        }
        if let Some(layer) = fanouts.iter().position(|f| *f == Fanout::Bounded(0)) {
            return Err(SamplingError::InvalidFanoutSpec(format!(
                "layer {layer} has a fanout of 0"
            )));
        }
        Ok(Self(fanouts))
    }

    /// Unbounded fanout on every one of `num_layers` layers.
    pub fn full(num_layers: usize) -> Result<Self> {
        Self::new(vec![Fanout::Unbounded; num_layers])
    }

    pub fn num_layers(&self) -> usize {
        self.0.len()
    }

    pub fn layer(&self, layer: usize) -> Fanout {
        self.0[layer]
    }

    pub fn as_slice(&self) -> &[Fanout] {
        &self.0
    }

    /// Checks that there is exactly one fanout per layer of a `depth`-layer model.
    pub fn check_depth(&self, depth: usize) -> Result<()> {
        if self.num_layers() == depth {
            Ok(())
        } else {
            Err(SamplingError::InvalidFanoutSpec(format!(
                "{} fanouts given for a model with {depth} layers",
                self.num_layers()
            )))
        }
    }
}

impl TryFrom<Vec<Fanout>> for FanoutSpec {
    type Error = SamplingError;

    fn try_from(fanouts: Vec<Fanout>) -> Result<Self> {
        Self::new(fanouts)
    }
}

impl From<FanoutSpec> for Vec<Fanout> {
    fn from(spec: FanoutSpec) -> Self {
        spec.0
    }
}

impl FromStr for FanoutSpec {
    type Err = SamplingError;

    /// Parses a comma separated list such as `10,25` or `5,all`.
    fn from_str(s: &str) -> Result<Self> {
        let fanouts = s
            .split(',')
            .enumerate()
            .map(|(layer, part)| {
                if part.trim().is_empty() {
                    Err(SamplingError::InvalidFanoutSpec(format!(
                        "empty fanout for layer {layer} in {s:?}"
                    )))
                } else {
                    part.parse()
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(fanouts)
    }
}

impl fmt::Display for FanoutSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

/// Policy selecting which in-edges of a destination node take part in a block.
///
/// Implementations must only return edges of the graph and must draw any randomness from the
/// supplied generator, so that a seeded generator reproduces the same sample.
pub trait NeighborSampler: Send + Sync {
    /// Appends the sampled in-edges of `dst` to `out` as `(source, edge id)` pairs.
    fn sample_edges<R: Rng + ?Sized>(
        &self,
        graph: &GraphStore,
        dst: NodeId,
        fanout: Fanout,
        rng: &mut R,
        out: &mut Vec<(NodeId, EdgeId)>,
    );

    /// Sampled in-neighbors of `dst`.
    ///
    /// Sampling picks distinct in-edges, not distinct sources: on a multigraph a source with
    /// parallel edges to `dst` can appear more than once.
    fn sample<R: Rng + ?Sized>(
        &self,
        graph: &GraphStore,
        dst: NodeId,
        fanout: Fanout,
        rng: &mut R,
    ) -> Vec<NodeId> {
        let mut edges = Vec::with_capacity(fanout.bound(graph.in_degree(dst)));
        self.sample_edges(graph, dst, fanout, rng, &mut edges);
        edges.into_iter().map(|(src, _)| src).collect()
    }
}

/// Uniform sampling without replacement over the in-edges of a node.
///
/// Nodes whose in-degree does not exceed the fanout keep all their in-edges and consume no
/// randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformNeighborSampler;

impl NeighborSampler for UniformNeighborSampler {
    fn sample_edges<R: Rng + ?Sized>(
        &self,
        graph: &GraphStore,
        dst: NodeId,
        fanout: Fanout,
        rng: &mut R,
        out: &mut Vec<(NodeId, EdgeId)>,
    ) {
        let sources = graph.in_neighbors(dst);
        let edge_ids = graph.in_edge_ids(dst);
        match fanout {
            Fanout::Bounded(k) if sources.len() > k => {
                let mut picked = index::sample(rng, sources.len(), k).into_vec();
                // keep the graph's in-edge order inside the block
                picked.sort_unstable();
                out.extend(picked.into_iter().map(|i| (sources[i], edge_ids[i])));
            }
            _ => out.extend(sources.iter().copied().zip(edge_ids.iter().copied())),
        }
    }
}
