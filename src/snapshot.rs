//! Capturing and rebuilding a network's topology and weights.
//!
//! A snapshot is taken from the host copies, so after device-side work call
//! [`Network::fetch_weights`] first (`train` already does). With the `serde`
//! feature the snapshot can be written to any serde format.
//!
//! Design notes:
//! - Sizes are stored without the bias neuron, the same way `create_layer`
//!   takes them.
//! - Rebuilding validates layer counts, weight lengths, and that every weight
//!   is finite before touching a backend.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::{Error, Network, Result};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub format_version: u32,
    /// Neurons per layer, bias excluded, first to last.
    pub layer_sizes: Vec<usize>,
    /// One row-major `(size, next.size)` matrix per layer boundary.
    pub weights: Vec<Vec<f32>>,
}

impl NetworkSnapshot {
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported snapshot format_version {}; expected {}",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.layer_sizes.is_empty() {
            return Err(Error::EmptyNetwork);
        }
        if self.layer_sizes.contains(&0) {
            return Err(Error::InvalidConfig(
                "all layer sizes must be > 0".to_owned(),
            ));
        }
        if self.weights.len() != self.layer_sizes.len() - 1 {
            return Err(Error::InvalidShape(format!(
                "{} layers need {} weight matrices, got {}",
                self.layer_sizes.len(),
                self.layer_sizes.len() - 1,
                self.weights.len()
            )));
        }
        for (i, (pair, w)) in self.layer_sizes.windows(2).zip(&self.weights).enumerate() {
            let expected = (pair[0] + 1) * (pair[1] + 1);
            if w.len() != expected {
                return Err(Error::InvalidShape(format!(
                    "weight matrix {i} has len {}, expected {expected}",
                    w.len()
                )));
            }
            if w.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "weight matrix {i} contains non-finite values"
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the chain on `backend` with these weights. The result still
    /// needs `upload` before it can run.
    pub fn build<B: ComputeBackend>(&self, backend: B) -> Result<Network<B>> {
        self.validate()?;
        let mut net = Network::with_seed(backend, 0);
        for &n in &self.layer_sizes {
            net.create_layer(n)?;
        }
        net.set_weights(&self.weights)?;
        Ok(net)
    }
}

impl<B: ComputeBackend> Network<B> {
    /// Capture topology and host weights.
    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            layer_sizes: self.layers.iter().map(|l| l.neurons()).collect(),
            weights: self
                .layers
                .iter()
                .filter_map(|l| l.weights().map(<[f32]>::to_vec))
                .collect(),
        }
    }

    /// Same as [`NetworkSnapshot::build`].
    pub fn from_snapshot(backend: B, snapshot: &NetworkSnapshot) -> Result<Self> {
        snapshot.build(backend)
    }
}
