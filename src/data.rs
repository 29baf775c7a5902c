//! Training sets.
//!
//! A `Dataset` pairs each input row with its expected output row. Rows are
//! stored contiguously (row-major) so the training loop can hand slices
//! straight to the staging calls.

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<f32>,
    targets: Vec<f32>,
    len: usize,
    input_dim: usize,
    target_dim: usize,
}

impl Dataset {
    /// Build a dataset from per-sample rows.
    ///
    /// Fails if the two sides have different row counts or if any row's
    /// length differs from the first row on its side.
    pub fn from_rows(inputs: &[Vec<f32>], targets: &[Vec<f32>]) -> Result<Self> {
        if inputs.len() != targets.len() {
            return Err(Error::InvalidShape(format!(
                "training inputs/outputs length mismatch: {} vs {}",
                inputs.len(),
                targets.len()
            )));
        }
        if inputs.is_empty() {
            return Err(Error::InvalidShape(
                "training set must not be empty".to_owned(),
            ));
        }

        let input_dim = inputs[0].len();
        let target_dim = targets[0].len();
        if input_dim == 0 || target_dim == 0 {
            return Err(Error::InvalidShape(
                "training rows must not be empty".to_owned(),
            ));
        }

        let mut inputs_flat = Vec::with_capacity(inputs.len() * input_dim);
        for (i, row) in inputs.iter().enumerate() {
            if row.len() != input_dim {
                return Err(Error::InvalidShape(format!(
                    "input row {i} has len {}, expected {input_dim}",
                    row.len()
                )));
            }
            inputs_flat.extend_from_slice(row);
        }

        let mut targets_flat = Vec::with_capacity(targets.len() * target_dim);
        for (i, row) in targets.iter().enumerate() {
            if row.len() != target_dim {
                return Err(Error::InvalidShape(format!(
                    "output row {i} has len {}, expected {target_dim}",
                    row.len()
                )));
            }
            targets_flat.extend_from_slice(row);
        }

        Ok(Self {
            inputs: inputs_flat,
            targets: targets_flat,
            len: inputs.len(),
            input_dim,
            target_dim,
        })
    }

    /// Build a dataset from flat row-major buffers.
    pub fn from_flat(
        inputs: Vec<f32>,
        targets: Vec<f32>,
        input_dim: usize,
        target_dim: usize,
    ) -> Result<Self> {
        if input_dim == 0 || target_dim == 0 {
            return Err(Error::InvalidShape(
                "input_dim and target_dim must be > 0".to_owned(),
            ));
        }
        if inputs.is_empty() || inputs.len() % input_dim != 0 {
            return Err(Error::InvalidShape(format!(
                "inputs length {} is not a non-zero multiple of input_dim {input_dim}",
                inputs.len()
            )));
        }
        let len = inputs.len() / input_dim;
        if targets.len() != len * target_dim {
            return Err(Error::InvalidShape(format!(
                "targets length {} does not match len * target_dim ({len} * {target_dim})",
                targets.len()
            )));
        }

        Ok(Self {
            inputs,
            targets,
            len,
            input_dim,
            target_dim,
        })
    }

    /// The four rows of the XOR truth table.
    pub fn xor() -> Self {
        Self {
            inputs: vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
            targets: vec![0.0, 1.0, 1.0, 0.0],
            len: 4,
            input_dim: 2,
            target_dim: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    #[inline]
    pub fn target_dim(&self) -> usize {
        self.target_dim
    }

    /// Panics if `idx >= len`.
    #[inline]
    pub fn input(&self, idx: usize) -> &[f32] {
        let start = idx * self.input_dim;
        &self.inputs[start..start + self.input_dim]
    }

    /// Panics if `idx >= len`.
    #[inline]
    pub fn target(&self, idx: usize) -> &[f32] {
        let start = idx * self.target_dim;
        &self.targets[start..start + self.target_dim]
    }
}
