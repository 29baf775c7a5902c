//! Activation functions applied by the arithmetic kernels.
//!
//! The forward kernel stores *post-activation* values in each layer's value
//! buffer. Backpropagation never sees the weighted sum, so the derivative is
//! expressed in terms of the activation output `y`.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Element-wise activation function.
pub enum Activation {
    /// Logistic function, outputs in `(0, 1)`.
    #[default]
    Sigmoid,
    /// Hyperbolic tangent, outputs in `(-1, 1)`.
    Tanh,
}

impl Activation {
    #[inline]
    pub fn forward(self, x: f32) -> f32 {
        match self {
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
        }
    }

    /// Derivative of the activation, given its output `y`.
    #[inline]
    pub fn derivative_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    // Numerically stable on both tails.
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}
