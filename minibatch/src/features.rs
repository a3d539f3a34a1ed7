//! Dense row-major node feature storage.

use rayon::prelude::*;

use crate::{NodeId, Result, SamplingError};

/// A `[num_rows, dim]` row-major `f32` matrix: raw node features, or one layer's outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    num_rows: usize,
    dim: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(num_rows: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != num_rows * dim {
            return Err(SamplingError::ShapeMismatch(format!(
                "expected {num_rows} x {dim} = {} values, got {}",
                num_rows * dim,
                data.len()
            )));
        }
        Ok(Self {
            num_rows,
            dim,
            data,
        })
    }

    pub fn zeros(num_rows: usize, dim: usize) -> Self {
        Self {
            num_rows,
            dim,
            data: vec![0.0; num_rows * dim],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Copies the rows of `nodes`, in order, into a new matrix: row `i` of the result holds the
    /// features of `nodes[i]`. Every node must be a row of `self`.
    pub fn gather(&self, nodes: &[NodeId]) -> FeatureMatrix {
        let mut data = vec![0.0; nodes.len() * self.dim];
        if self.dim > 0 {
            data.par_chunks_mut(self.dim)
                .zip(nodes.par_iter())
                .for_each(|(out, &node)| out.copy_from_slice(self.row(node as usize)));
        }
        FeatureMatrix {
            num_rows: nodes.len(),
            dim: self.dim,
            data,
        }
    }

    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_is_checked() {
        assert!(FeatureMatrix::new(2, 3, vec![0.0; 6]).is_ok());
        assert!(matches!(
            FeatureMatrix::new(2, 3, vec![0.0; 5]),
            Err(SamplingError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_gather_rows_in_order() -> anyhow::Result<()> {
        let features = FeatureMatrix::new(4, 2, (0..8).map(|v| v as f32).collect())?;
        let gathered = features.gather(&[3, 0, 3]);
        assert_eq!(gathered.num_rows(), 3);
        assert_eq!(gathered.as_slice(), &[6.0, 7.0, 0.0, 1.0, 6.0, 7.0]);
        assert_eq!(features.gather(&[]).num_rows(), 0);
        Ok(())
    }

    #[test]
    fn test_zero_width_gather() {
        let features = FeatureMatrix::zeros(3, 0);
        let gathered = features.gather(&[2, 1]);
        assert_eq!(gathered.num_rows(), 2);
        assert!(gathered.as_slice().is_empty());
    }
}
