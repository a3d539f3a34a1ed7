//! Configuration surface of the minibatch loader, loadable from JSON.
//!
//! ```json
//! {
//!   "fanouts": [10, 25],
//!   "batch_size": 1024,
//!   "shuffle": true,
//!   "drop_last": false,
//!   "num_workers": 4,
//!   "random_seed": 7
//! }
//! ```

use std::{path::Path, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    BlockChainAssembler, FanoutSpec, GraphStore, MinibatchIterator, NodeId, Result,
    SamplingError, UniformNeighborSampler,
};

fn default_prefetch_factor() -> usize {
    2
}

/// How a seed sequence is split into batches and how batches are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Draw a fresh permutation of the seeds at the start of every epoch.
    #[serde(default)]
    pub shuffle: bool,
    /// Discard the last batch of an epoch when it is shorter than `batch_size`.
    #[serde(default)]
    pub drop_last: bool,
    /// Prefetch worker threads; 0 builds batches on the consuming thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Batches kept in flight per worker.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    /// Seed of every random stream of the loader. A random seed is drawn when absent.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl BatchOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            num_workers: 0,
            prefetch_factor: default_prefetch_factor(),
            random_seed: None,
        }
    }

    pub fn with_shuffle(self, shuffle: bool) -> Self {
        Self { shuffle, ..self }
    }

    pub fn with_drop_last(self, drop_last: bool) -> Self {
        Self { drop_last, ..self }
    }

    pub fn with_num_workers(self, num_workers: usize) -> Self {
        Self {
            num_workers,
            ..self
        }
    }

    pub fn with_prefetch_factor(self, prefetch_factor: usize) -> Self {
        Self {
            prefetch_factor,
            ..self
        }
    }

    pub fn with_random_seed(self, random_seed: u64) -> Self {
        Self {
            random_seed: Some(random_seed),
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SamplingError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.prefetch_factor == 0 {
            return Err(SamplingError::InvalidConfig(
                "prefetch_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of batches an epoch over `num_seeds` seeds yields.
    pub fn num_batches(&self, num_seeds: usize) -> usize {
        if self.drop_last {
            num_seeds / self.batch_size
        } else {
            num_seeds.div_ceil(self.batch_size)
        }
    }
}

/// Full loader configuration: per-layer fanouts plus batching options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub fanouts: FanoutSpec,
    #[serde(flatten)]
    pub batch: BatchOptions,
}

impl LoaderConfig {
    pub fn new(fanouts: FanoutSpec, batch: BatchOptions) -> Self {
        Self { fanouts, batch }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing loader configuration")?;
        config.batch.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading loader configuration {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("loading {}", path.display()))
    }

    pub fn num_layers(&self) -> usize {
        self.fanouts.num_layers()
    }

    /// Builds a uniform-sampling iterator over `seeds` for a model of `num_layers` layers.
    pub fn build_iterator(
        &self,
        graph: Arc<GraphStore>,
        seeds: Vec<NodeId>,
        num_layers: usize,
    ) -> Result<MinibatchIterator<UniformNeighborSampler>> {
        let assembler = BlockChainAssembler::new(
            graph,
            UniformNeighborSampler,
            self.fanouts.clone(),
            num_layers,
        )?;
        MinibatchIterator::new(assembler, seeds, self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fanout;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_parse_with_defaults() -> anyhow::Result<()> {
        let config = LoaderConfig::from_json_str(r#"{"fanouts": [10, "all"], "batch_size": 64}"#)?;
        assert_eq!(
            config.fanouts.as_slice(),
            &[Fanout::Bounded(10), Fanout::Unbounded]
        );
        assert_eq!(config.batch, BatchOptions::new(64));
        Ok(())
    }

    #[test]
    fn test_parse_full() -> anyhow::Result<()> {
        let config = LoaderConfig::from_json_str(
            r#"{
                "fanouts": [5, 5, -1],
                "batch_size": 32,
                "shuffle": true,
                "drop_last": true,
                "num_workers": 3,
                "prefetch_factor": 4,
                "random_seed": 99
            }"#,
        )?;
        assert_eq!(config.num_layers(), 3);
        assert_eq!(
            config.batch,
            BatchOptions::new(32)
                .with_shuffle(true)
                .with_drop_last(true)
                .with_num_workers(3)
                .with_prefetch_factor(4)
                .with_random_seed(99)
        );
        Ok(())
    }

    #[test]
    fn test_round_trip_through_json() -> anyhow::Result<()> {
        let config = LoaderConfig::new("3,all".parse()?, BatchOptions::new(8).with_random_seed(1));
        let json = serde_json::to_string(&config)?;
        assert_eq!(LoaderConfig::from_json_str(&json)?, config);
        Ok(())
    }

    #[rstest]
    #[case(r#"{"fanouts": [2], "batch_size": 0}"#)]
    #[case(r#"{"fanouts": [2], "batch_size": 4, "prefetch_factor": 0}"#)]
    #[case(r#"{"fanouts": [], "batch_size": 4}"#)]
    #[case(r#"{"fanouts": [0], "batch_size": 4}"#)]
    #[case(r#"{"batch_size": 4}"#)]
    fn test_invalid_configs(#[case] json: &str) {
        assert!(LoaderConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_zero_batch_size_is_invalid_config() {
        assert!(matches!(
            BatchOptions::new(0).validate(),
            Err(SamplingError::InvalidConfig(_))
        ));
    }

    #[rstest]
    #[case(10, 3, false, 4)]
    #[case(10, 3, true, 3)]
    #[case(9, 3, false, 3)]
    #[case(9, 3, true, 3)]
    #[case(0, 3, false, 0)]
    #[case(2, 3, true, 0)]
    fn test_num_batches(
        #[case] num_seeds: usize,
        #[case] batch_size: usize,
        #[case] drop_last: bool,
        #[case] expected: usize,
    ) {
        let options = BatchOptions::new(batch_size).with_drop_last(drop_last);
        assert_eq!(options.num_batches(num_seeds), expected);
    }

    #[test]
    fn test_from_path() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"fanouts": "ignored", "batch_size": 4}}"#)?;
        assert!(LoaderConfig::from_path(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"fanouts": [4, 4], "batch_size": 16, "shuffle": true}}"#)?;
        let config = LoaderConfig::from_path(file.path())?;
        assert!(config.batch.shuffle);
        assert_eq!(config.batch.batch_size, 16);
        Ok(())
    }
}
