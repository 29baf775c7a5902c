//! One stage of the network: neuron values plus the outgoing weight matrix.
//!
//! Every layer carries a trailing bias neuron fixed at `1.0`. It is an input
//! to the next layer's weighted sums but is never itself computed, so
//! producing values iterates `size - 1` slots while consuming them iterates
//! all `size`.
//!
//! Layers do not own each other. Links are [`LayerId`] handles plus the
//! linked layer's size, and operations that touch a neighbour's buffers take
//! that neighbour explicitly.

use std::fmt;

use log::debug;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::backend::{BufferId, ComputeBackend, Dispatch, MemAccess};
use crate::error::Direction;
use crate::{Error, Result};

/// Position of a layer within its network, counted per network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning reference to a neighbouring layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub id: LayerId,
    /// Neighbour size, bias included.
    pub size: usize,
}

/// Lifecycle of a layer's host and device state.
///
/// `Staged` and `Computed` alternate every pass; all other transitions only
/// move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerState {
    Unlinked,
    /// Output linked, weight matrix allocated.
    Linked,
    /// Device buffers created and seeded from the host copy.
    Buffered,
    /// Device mirror holds the host values/weights.
    Staged,
    /// A dispatch wrote this layer's buffers; the host copy is stale until fetched.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceBuffers {
    values: BufferId,
    weights: Option<BufferId>,
}

#[derive(Debug, Clone)]
pub struct Layer {
    id: LayerId,
    /// Neuron count, bias included.
    size: usize,
    values: Vec<f32>,
    /// Row-major `(size, next.size)`, present iff `next` is set.
    weights: Option<Vec<f32>>,
    previous: Option<Link>,
    next: Option<Link>,
    buffers: Option<DeviceBuffers>,
    state: LayerState,
}

impl Layer {
    /// A layer of `neurons` computed neurons plus the bias neuron.
    pub fn new(id: LayerId, neurons: usize) -> Result<Self> {
        if neurons == 0 {
            return Err(Error::InvalidConfig(
                "a layer needs at least one neuron".to_owned(),
            ));
        }
        let size = neurons + 1;
        let mut values = vec![0.0; size];
        values[size - 1] = 1.0;

        Ok(Self {
            id,
            size,
            values,
            weights: None,
            previous: None,
            next: None,
            buffers: None,
            state: LayerState::Unlinked,
        })
    }

    /// Construct and link in one step.
    pub fn linked(
        id: LayerId,
        neurons: usize,
        previous: Option<&Layer>,
        next: Option<&Layer>,
    ) -> Result<Self> {
        let mut layer = Self::new(id, neurons)?;
        if let Some(previous) = previous {
            layer.link_input(previous)?;
        }
        if let Some(next) = next {
            layer.link_output(next)?;
        }
        Ok(layer)
    }

    #[inline]
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Neuron count, bias included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Neuron count, bias excluded.
    #[inline]
    pub fn neurons(&self) -> usize {
        self.size - 1
    }

    /// Host copy of all values, bias last.
    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Host copy of the computed (non-bias) values.
    #[inline]
    pub fn neuron_values(&self) -> &[f32] {
        &self.values[..self.size - 1]
    }

    /// Host copy of the outgoing weights, if an output layer is linked.
    #[inline]
    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    #[inline]
    pub fn previous(&self) -> Option<Link> {
        self.previous
    }

    #[inline]
    pub fn next(&self) -> Option<Link> {
        self.next
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }

    #[inline]
    pub fn state(&self) -> LayerState {
        self.state
    }

    #[inline]
    pub fn value_buffer(&self) -> Option<BufferId> {
        self.buffers.map(|b| b.values)
    }

    #[inline]
    pub fn weight_buffer(&self) -> Option<BufferId> {
        self.buffers.and_then(|b| b.weights)
    }

    pub fn link_input(&mut self, previous: &Layer) -> Result<()> {
        if previous.id == self.id {
            return Err(Error::InvalidConfig(format!(
                "layer {} cannot be its own input",
                self.id
            )));
        }
        self.previous = Some(Link {
            id: previous.id,
            size: previous.size,
        });
        Ok(())
    }

    /// Link `next` as this layer's output and allocate the `size * next.size`
    /// weight matrix (zeroed) unless one of that length already exists.
    pub fn link_output(&mut self, next: &Layer) -> Result<()> {
        if next.id == self.id {
            return Err(Error::InvalidConfig(format!(
                "layer {} cannot be its own output",
                self.id
            )));
        }
        if self.buffers.is_some() {
            return Err(Error::InvalidState(format!(
                "layer {} already has device buffers and cannot be relinked",
                self.id
            )));
        }

        let len = self.size * next.size;
        if self.weights.as_ref().map(Vec::len) != Some(len) {
            self.weights = Some(vec![0.0; len]);
        }
        self.next = Some(Link {
            id: next.id,
            size: next.size,
        });
        self.state = LayerState::Linked;
        Ok(())
    }

    /// Fill the weight matrix with independent draws from `[min, max)`.
    pub fn init_random_weights<R: Rng + ?Sized>(
        &mut self,
        min: f32,
        max: f32,
        rng: &mut R,
    ) -> Result<()> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(Error::InvalidConfig(format!(
                "weight range [{min}, {max}) is empty or not finite"
            )));
        }
        let id = self.id;
        let weights = self.weights.as_mut().ok_or(Error::LayerNotLinked {
            layer: id,
            direction: Direction::Output,
        })?;

        let dist = Uniform::new(min, max);
        for w in weights.iter_mut() {
            *w = dist.sample(rng);
        }
        Ok(())
    }

    /// Overwrite every value except the bias.
    pub fn set_values(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.size - 1 {
            return Err(Error::InvalidShape(format!(
                "layer {} takes {} values, got {}",
                self.id,
                self.size - 1,
                values.len()
            )));
        }
        self.values[..self.size - 1].copy_from_slice(values);
        Ok(())
    }

    /// Overwrite the whole weight matrix.
    pub fn set_weights(&mut self, weights: &[f32]) -> Result<()> {
        let id = self.id;
        let current = self.weights.as_mut().ok_or(Error::LayerNotLinked {
            layer: id,
            direction: Direction::Output,
        })?;
        if weights.len() != current.len() {
            return Err(Error::InvalidShape(format!(
                "layer {id} has {} weights, got {}",
                current.len(),
                weights.len()
            )));
        }
        current.copy_from_slice(weights);
        Ok(())
    }

    /// Allocate the device mirror, initialised from the current host copies.
    /// Calling it again is a no-op.
    pub fn create_buffers<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        if self.buffers.is_some() {
            return Ok(());
        }
        let values = backend.create_f32_buffer(MemAccess::ReadWrite, self.size)?;
        backend.write_f32(values, &self.values)?;
        let weights = match &self.weights {
            Some(w) => {
                let id = backend.create_f32_buffer(MemAccess::ReadWrite, w.len())?;
                backend.write_f32(id, w)?;
                Some(id)
            }
            None => None,
        };
        debug!(
            "layer {}: created buffers (values {values}, weights {weights:?})",
            self.id
        );
        self.buffers = Some(DeviceBuffers { values, weights });
        self.state = LayerState::Buffered;
        Ok(())
    }

    fn device_buffers(&self) -> Result<DeviceBuffers> {
        self.buffers.ok_or_else(|| {
            Error::InvalidState(format!("layer {} has no device buffers", self.id))
        })
    }

    fn device_weights(&self) -> Result<BufferId> {
        let buffers = self.device_buffers()?;
        buffers.weights.ok_or(Error::LayerNotLinked {
            layer: self.id,
            direction: Direction::Output,
        })
    }

    /// Push the host values (bias included) to the device.
    pub fn stage_values<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        let buffers = self.device_buffers()?;
        backend.write_f32(buffers.values, &self.values)?;
        self.state = LayerState::Staged;
        Ok(())
    }

    /// Push the host weight matrix to the device.
    pub fn stage_weights<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        let buffer = self.device_weights()?;
        let weights = self.weights.as_deref().unwrap_or(&[]);
        backend.write_f32(buffer, weights)?;
        self.state = LayerState::Staged;
        Ok(())
    }

    /// Stage values, and weights when an output layer is linked.
    pub fn stage_all<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        self.stage_values(backend)?;
        if self.weights.is_some() {
            self.stage_weights(backend)?;
        }
        Ok(())
    }

    /// Pull the device values back into the host copy.
    pub fn fetch_values<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        let buffers = self.device_buffers()?;
        backend.read_f32(buffers.values, &mut self.values)?;
        debug_assert_eq!(self.values[self.size - 1], 1.0, "bias slot was overwritten");
        self.state = LayerState::Staged;
        Ok(())
    }

    /// Pull the device weights back into the host copy.
    pub fn fetch_weights<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        let buffer = self.device_weights()?;
        if let Some(weights) = self.weights.as_mut() {
            backend.read_f32(buffer, weights)?;
        }
        Ok(())
    }

    fn expect_next(&self, next: &Layer) -> Result<Link> {
        match self.next {
            Some(link) if link.id == next.id => Ok(link),
            Some(link) => Err(Error::InvalidState(format!(
                "layer {} outputs to layer {}, not {}",
                self.id, link.id, next.id
            ))),
            None => Err(Error::LayerNotLinked {
                layer: self.id,
                direction: Direction::Output,
            }),
        }
    }

    /// Compute `next`'s non-bias values on the device from this layer's
    /// staged values and weights.
    pub fn forward_step<B: ComputeBackend + ?Sized>(
        &self,
        next: &mut Layer,
        backend: &mut B,
    ) -> Result<()> {
        let link = self.expect_next(next)?;
        let own = self.device_buffers()?;
        let weights = self.device_weights()?;
        let next_values = next.device_buffers()?.values;

        backend.enqueue(Dispatch::forward(
            self.size,
            link.size,
            own.values,
            weights,
            next_values,
        ))?;
        backend.finish()?;
        next.state = LayerState::Computed;
        Ok(())
    }

    /// Terminal-layer delta against `expected` (a buffer of `size - 1`
    /// targets), written into `delta`.
    pub fn output_error<B: ComputeBackend + ?Sized>(
        &self,
        expected: BufferId,
        delta: BufferId,
        backend: &mut B,
    ) -> Result<()> {
        if let Some(link) = self.next {
            return Err(Error::InvalidState(format!(
                "output error requested on layer {}, which feeds layer {}",
                self.id, link.id
            )));
        }
        let own = self.device_buffers()?;
        backend.enqueue(Dispatch::output_error(self.size, own.values, expected, delta))?;
        backend.finish()
    }

    /// This layer's delta from the next layer's delta and the connecting
    /// weights, written into `delta`.
    pub fn backpropagate_error<B: ComputeBackend + ?Sized>(
        &self,
        next_delta: BufferId,
        delta: BufferId,
        backend: &mut B,
    ) -> Result<()> {
        let link = self.next.ok_or(Error::LayerNotLinked {
            layer: self.id,
            direction: Direction::Output,
        })?;
        let own = self.device_buffers()?;
        let weights = self.device_weights()?;
        backend.enqueue(Dispatch::backpropagate(
            self.size,
            link.size,
            own.values,
            weights,
            next_delta,
            delta,
        ))?;
        backend.finish()
    }

    /// Apply this layer's `delta` to `previous`'s weight matrix on the device.
    pub fn update_weights<B: ComputeBackend + ?Sized>(
        &self,
        previous: &mut Layer,
        delta: BufferId,
        learning_rate: f32,
        backend: &mut B,
    ) -> Result<()> {
        match self.previous {
            Some(link) if link.id == previous.id => {}
            Some(link) => {
                return Err(Error::InvalidState(format!(
                    "layer {} takes input from layer {}, not {}",
                    self.id, link.id, previous.id
                )))
            }
            None => {
                return Err(Error::LayerNotLinked {
                    layer: self.id,
                    direction: Direction::Input,
                })
            }
        }
        let prev = previous.device_buffers()?;
        let prev_weights = previous.device_weights()?;

        backend.enqueue(Dispatch::update_weights(
            previous.size,
            self.size,
            learning_rate,
            prev.values,
            delta,
            prev_weights,
        ))?;
        backend.finish()?;
        previous.state = LayerState::Computed;
        Ok(())
    }
}
