//! The layer chain and its host-side controller.
//!
//! `Network` owns every `Layer` in a `Vec`, first to last, and the backend
//! the layers dispatch to. Each pass is strictly sequential: layer `i + 1`'s
//! forward step runs only after layer `i`'s dispatch has finished.

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::ComputeBackend;
use crate::layer::{Layer, LayerId};
use crate::{Error, Result};

/// Default range for the random weights drawn when a layer is linked.
pub const DEFAULT_WEIGHT_RANGE: (f32, f32) = (-0.5, 0.5);

#[derive(Debug)]
pub struct Network<B: ComputeBackend> {
    pub(crate) backend: B,
    pub(crate) layers: Vec<Layer>,
    /// Numbering for the next created layer; counted per network.
    next_layer_number: usize,
    rng: StdRng,
    weight_range: (f32, f32),
}

impl<B: ComputeBackend> Network<B> {
    /// An empty network whose random weights are seeded from entropy.
    pub fn new(backend: B) -> Self {
        Self::with_rng(backend, StdRng::from_entropy())
    }

    /// An empty network with deterministic random weights.
    pub fn with_seed(backend: B, seed: u64) -> Self {
        Self::with_rng(backend, StdRng::seed_from_u64(seed))
    }

    fn with_rng(backend: B, rng: StdRng) -> Self {
        Self {
            backend,
            layers: Vec::new(),
            next_layer_number: 0,
            rng,
            weight_range: DEFAULT_WEIGHT_RANGE,
        }
    }

    /// Range `[min, max)` used for weights of layers linked from now on.
    pub fn set_weight_range(&mut self, min: f32, max: f32) -> Result<()> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(Error::InvalidConfig(format!(
                "weight range [{min}, {max}) is empty or not finite"
            )));
        }
        self.weight_range = (min, max);
        Ok(())
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.index())
    }

    #[inline]
    pub fn first(&self) -> Option<&Layer> {
        self.layers.first()
    }

    #[inline]
    pub fn last(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Append a layer of `neurons` neurons (bias added implicitly).
    ///
    /// The previous tail is linked to it, gets random weights, and has its
    /// device buffers created right away.
    pub fn create_layer(&mut self, neurons: usize) -> Result<LayerId> {
        let id = LayerId(self.next_layer_number);
        let mut layer = Layer::new(id, neurons)?;

        if let Some(prev) = self.layers.last_mut() {
            prev.link_output(&layer)?;
            layer.link_input(prev)?;
            let (min, max) = self.weight_range;
            prev.init_random_weights(min, max, &mut self.rng)?;
            prev.create_buffers(&mut self.backend)?;
            debug!("linked layer {} -> {}", prev.id(), id);
        }

        debug!("created layer {id} with {neurons} neurons");
        self.layers.push(layer);
        self.next_layer_number += 1;
        Ok(id)
    }

    /// Assign one weight list per layer boundary, in chain order.
    ///
    /// All lists are checked before any is applied.
    pub fn set_weights(&mut self, weights: &[Vec<f32>]) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::EmptyNetwork);
        }
        let boundaries = self.layers.len() - 1;
        if weights.len() != boundaries {
            return Err(Error::InvalidShape(format!(
                "network has {boundaries} layer boundaries, got {} weight lists",
                weights.len()
            )));
        }
        for (layer, list) in self.layers.iter().zip(weights) {
            let expected = layer.weights().map_or(0, <[f32]>::len);
            if list.len() != expected {
                return Err(Error::InvalidShape(format!(
                    "layer {} has {expected} weights, got {}",
                    layer.id(),
                    list.len()
                )));
            }
        }
        for (layer, list) in self.layers.iter_mut().zip(weights) {
            layer.set_weights(list)?;
        }
        Ok(())
    }

    /// Assign the first layer's (non-bias) values.
    pub fn set_input_values(&mut self, values: &[f32]) -> Result<()> {
        self.layers
            .first_mut()
            .ok_or(Error::EmptyNetwork)?
            .set_values(values)
    }

    /// Create the terminal layer's buffers and stage every layer's values
    /// and weights.
    pub fn upload(&mut self) -> Result<()> {
        let last = self.layers.last_mut().ok_or(Error::EmptyNetwork)?;
        last.create_buffers(&mut self.backend)?;

        for layer in &mut self.layers {
            layer.stage_all(&mut self.backend)?;
        }
        debug!("uploaded {} layers", self.layers.len());
        Ok(())
    }

    pub(crate) fn ensure_uploaded(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::EmptyNetwork);
        }
        if let Some(layer) = self.layers.iter().find(|l| l.value_buffer().is_none()) {
            return Err(Error::InvalidState(format!(
                "layer {} has no device buffers; call upload first",
                layer.id()
            )));
        }
        Ok(())
    }

    /// Set and stage the first layer's values.
    pub(crate) fn stage_input(&mut self, values: &[f32]) -> Result<()> {
        let first = self.layers.first_mut().ok_or(Error::EmptyNetwork)?;
        first.set_values(values)?;
        first.stage_values(&mut self.backend)
    }

    /// Forward pass over the whole chain. With `fetch`, every computed layer's
    /// values are read back to the host after its step.
    pub(crate) fn forward(&mut self, fetch: bool) -> Result<()> {
        for idx in 1..self.layers.len() {
            let (left, right) = self.layers.split_at_mut(idx);
            let layer = &left[idx - 1];
            let next = &mut right[0];
            layer.forward_step(next, &mut self.backend)?;
            if fetch {
                next.fetch_values(&mut self.backend)?;
            }
        }
        Ok(())
    }

    /// One inference pass over the staged state, first to last layer.
    ///
    /// Host copies of every computed layer are refreshed afterwards.
    pub fn run(&mut self) -> Result<()> {
        self.ensure_uploaded()?;
        self.forward(true)
    }

    /// Stage `input`, run, and return the terminal layer's activations.
    pub fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.ensure_uploaded()?;
        self.stage_input(input)?;
        self.forward(true)?;
        Ok(self.output().to_vec())
    }

    /// Host copy of the terminal layer's non-bias activations.
    pub fn output(&self) -> &[f32] {
        match self.layers.last() {
            Some(last) => last.neuron_values(),
            None => &[],
        }
    }

    /// Read back the terminal values and return the largest absolute
    /// deviation from `expected` over the non-bias neurons.
    pub fn max_error(&mut self, expected: &[f32]) -> Result<f32> {
        let last = self.layers.last_mut().ok_or(Error::EmptyNetwork)?;
        if expected.len() != last.neurons() {
            return Err(Error::InvalidShape(format!(
                "terminal layer has {} neurons, got {} expected values",
                last.neurons(),
                expected.len()
            )));
        }
        last.fetch_values(&mut self.backend)?;
        Ok(last
            .neuron_values()
            .iter()
            .zip(expected)
            .map(|(v, e)| (v - e).abs())
            .fold(0.0_f32, f32::max))
    }

    /// Whether every terminal value is within `1 - confidence` of `expected`.
    pub fn has_converged(&mut self, expected: &[f32], confidence: f32) -> Result<bool> {
        validate_confidence(confidence)?;
        Ok(self.max_error(expected)? <= 1.0 - confidence)
    }

    /// Refresh every layer's host weights from the device.
    pub fn fetch_weights(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            if layer.weight_buffer().is_some() {
                layer.fetch_weights(&mut self.backend)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_confidence(confidence: f32) -> Result<()> {
    if !(confidence.is_finite() && (0.0..=1.0).contains(&confidence)) {
        return Err(Error::InvalidConfig(format!(
            "confidence must be in [0, 1], got {confidence}"
        )));
    }
    Ok(())
}
