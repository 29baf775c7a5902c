use thiserror::Error;

use crate::layer::LayerId;

/// Which side of a layer a missing link was expected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("layer {layer} hasn't been linked to its {direction:?} layer")]
    LayerNotLinked { layer: LayerId, direction: Direction },

    #[error("network has no layers")]
    EmptyNetwork,

    /// A backend transfer or dispatch failed. Device buffers may be partially
    /// written; the run must not continue.
    #[error("device error during {op}: {reason}")]
    Device { op: &'static str, reason: String },
}

impl Error {
    pub(crate) fn device(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Device {
            op,
            reason: reason.into(),
        }
    }

    /// True for errors caused by the compute backend rather than by the caller.
    pub fn is_device(&self) -> bool {
        matches!(self, Error::Device { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
