//! A small multilayer perceptron whose arithmetic runs on a compute backend.
//!
//! `offload_mlp` keeps the network topology, host copies of values and
//! weights, and the training loop on the host, and hands every per-layer
//! computation (weighted sum + activation, output error, backpropagated
//! delta, weight update) to a [`ComputeBackend`] as a kernel dispatch.
//!
//! # Topology
//!
//! A network is a linear chain of fully-connected layers. Each layer carries
//! one extra bias neuron, fixed at `1.0`, that feeds the next layer's
//! weighted sums but is never computed. A layer of `n` neurons therefore has
//! `size = n + 1` values, and its weight matrix to a layer of size `m` has
//! `size * m` entries, row-major by source neuron.
//!
//! # Host and device copies
//!
//! Setters only change host copies. Device buffers follow when staged
//! (`upload`, `Layer::stage_*`) and host copies follow device results when
//! fetched (`run`, `max_error`, `fetch_weights`). Re-stage after any host
//! mutation you want the next dispatch to see.
//!
//! # Errors
//!
//! Configuration mistakes (wrong lengths, missing links, empty chains) are
//! reported before anything is mutated. Backend failures come back as
//! [`Error::Device`]; device state is undefined afterwards and the run
//! should be abandoned. Failing to converge is a normal [`TrainReport`].
//!
//! # Quick start
//!
//! ```rust
//! use offload_mlp::{Dataset, HostBackend, Network, TrainConfig};
//!
//! # fn main() -> offload_mlp::Result<()> {
//! let mut net = Network::with_seed(HostBackend::new(), 0);
//! net.create_layer(2)?;
//! net.create_layer(4)?;
//! net.create_layer(1)?;
//! net.upload()?;
//!
//! let report = net.train(
//!     &Dataset::xor(),
//!     &TrainConfig {
//!         max_iterations: 2_000,
//!         ..TrainConfig::default()
//!     },
//! )?;
//! println!("converged={} after {}", report.converged, report.iterations);
//!
//! let y = net.predict(&[1.0, 0.0])?;
//! assert_eq!(y.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod backend;
pub mod data;
pub mod error;
pub mod layer;
pub mod network;
pub mod snapshot;
pub mod train;

pub use activation::Activation;
pub use backend::{BufferId, ComputeBackend, Dispatch, HostBackend, Kernel, KernelArg, MemAccess};
pub use data::Dataset;
pub use error::{Direction, Error, Result};
pub use layer::{Layer, LayerId, LayerState, Link};
pub use network::Network;
pub use snapshot::NetworkSnapshot;
pub use train::{Sampling, TrainConfig, TrainReport};
