use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backend::{BufferId, ComputeBackend, MemAccess};
use crate::network::validate_confidence;
use crate::{Dataset, Error, Network, Result};

/// How the training loop picks the example for each iteration.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// Walk the training set in order, wrapping around.
    #[default]
    Cyclic,
    /// Draw uniformly at random from a seeded generator.
    Random { seed: u64 },
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    pub learning_rate: f32,
    /// Converged once every output is within `1 - confidence` of its target.
    pub confidence: f32,
    /// Upper bound on training iterations; reaching it means giving up.
    pub max_iterations: usize,
    /// Iterations between convergence checks over the whole training set.
    pub check_interval: usize,
    pub sampling: Sampling,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            confidence: 0.8,
            max_iterations: 100_000,
            check_interval: 100,
            sampling: Sampling::Cyclic,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        validate_confidence(self.confidence)?;
        if self.check_interval == 0 {
            return Err(Error::InvalidConfig(
                "check_interval must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub converged: bool,
    /// Weight updates applied before the loop stopped.
    pub iterations: usize,
    /// Worst error over the training set at each convergence check, in order.
    pub checkpoints: Vec<f32>,
}

impl TrainReport {
    pub fn final_error(&self) -> Option<f32> {
        self.checkpoints.last().copied()
    }
}

enum Picker {
    Cyclic(usize),
    Random(StdRng),
}

impl Picker {
    fn new(sampling: Sampling) -> Self {
        match sampling {
            Sampling::Cyclic => Picker::Cyclic(0),
            Sampling::Random { seed } => Picker::Random(StdRng::seed_from_u64(seed)),
        }
    }

    fn pick(&mut self, len: usize) -> usize {
        match self {
            Picker::Cyclic(pos) => {
                let idx = *pos % len;
                *pos = idx + 1;
                idx
            }
            Picker::Random(rng) => rng.gen_range(0..len),
        }
    }
}

/// Device buffers used only while training: the current target and one
/// delta buffer per layer after the first.
struct TrainingBuffers {
    expected: BufferId,
    deltas: Vec<Option<BufferId>>,
}

impl TrainingBuffers {
    fn new<B: ComputeBackend>(net: &mut Network<B>) -> Result<Self> {
        let outputs = net.layers.last().map_or(0, |l| l.neurons());
        let expected = net
            .backend
            .create_f32_buffer(MemAccess::ReadOnly, outputs)?;

        let mut buffers = Self {
            expected,
            deltas: Vec::with_capacity(net.layers.len()),
        };
        buffers.deltas.push(None);
        for idx in 1..net.layers.len() {
            let neurons = net.layers[idx].neurons();
            match net.backend.create_f32_buffer(MemAccess::ReadWrite, neurons) {
                Ok(id) => buffers.deltas.push(Some(id)),
                Err(e) => {
                    let _ = buffers.release(&mut net.backend);
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    fn delta(&self, idx: usize) -> BufferId {
        self.deltas[idx].expect("every layer after the first has a delta buffer")
    }

    fn release<B: ComputeBackend>(self, backend: &mut B) -> Result<()> {
        backend.release_buffer(self.expected)?;
        for id in self.deltas.into_iter().flatten() {
            backend.release_buffer(id)?;
        }
        Ok(())
    }
}

impl<B: ComputeBackend> Network<B> {
    /// Train with per-example SGD until every example is within
    /// `1 - confidence` of its target or `max_iterations` run out.
    ///
    /// Not converging is reported through [`TrainReport::converged`], not as
    /// an error. Host weights are refreshed from the device before returning.
    pub fn train(&mut self, data: &Dataset, cfg: &TrainConfig) -> Result<TrainReport> {
        cfg.validate()?;
        if self.layers.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "training needs at least two layers, network has {}",
                self.layers.len()
            )));
        }
        self.ensure_uploaded()?;

        let inputs = self.layers[0].neurons();
        let outputs = self.layers[self.layers.len() - 1].neurons();
        if data.input_dim() != inputs {
            return Err(Error::InvalidShape(format!(
                "training input rows have len {}, first layer has {inputs} neurons",
                data.input_dim()
            )));
        }
        if data.target_dim() != outputs {
            return Err(Error::InvalidShape(format!(
                "training output rows have len {}, last layer has {outputs} neurons",
                data.target_dim()
            )));
        }

        let buffers = TrainingBuffers::new(self)?;
        let mut checkpoints = Vec::new();
        let outcome = self.run_iterations(data, cfg, &buffers, &mut checkpoints);
        let released = buffers.release(&mut self.backend);
        let converged_at = outcome?;
        released?;
        self.fetch_weights()?;

        let report = match converged_at {
            Some(iterations) => {
                info!("converged after {iterations} iterations");
                TrainReport {
                    converged: true,
                    iterations,
                    checkpoints,
                }
            }
            None => {
                info!(
                    "no convergence within {} iterations",
                    cfg.max_iterations
                );
                TrainReport {
                    converged: false,
                    iterations: cfg.max_iterations,
                    checkpoints,
                }
            }
        };
        Ok(report)
    }

    /// The SGD loop proper. Returns the iteration at which the convergence
    /// check passed, if any.
    fn run_iterations(
        &mut self,
        data: &Dataset,
        cfg: &TrainConfig,
        buffers: &TrainingBuffers,
        checkpoints: &mut Vec<f32>,
    ) -> Result<Option<usize>> {
        let mut picker = Picker::new(cfg.sampling);
        for iteration in 0..cfg.max_iterations {
            let idx = picker.pick(data.len());
            self.stage_input(data.input(idx))?;
            self.forward(false)?;

            if iteration % cfg.check_interval == 0 {
                let worst = self.worst_error(data)?;
                checkpoints.push(worst);
                debug!("iteration {iteration}: worst error {worst}");
                if worst <= 1.0 - cfg.confidence {
                    return Ok(Some(iteration));
                }
                // The sweep overwrote every layer's staged values.
                self.stage_input(data.input(idx))?;
                self.forward(false)?;
            }

            self.backend.write_f32(buffers.expected, data.target(idx))?;
            self.backpropagate(buffers)?;
            self.update_weights(buffers, cfg.learning_rate)?;
        }
        Ok(None)
    }

    /// Largest `max_error` over every example, each run through a fresh
    /// forward pass.
    fn worst_error(&mut self, data: &Dataset) -> Result<f32> {
        let mut worst = 0.0_f32;
        for idx in 0..data.len() {
            self.stage_input(data.input(idx))?;
            self.forward(false)?;
            worst = worst.max(self.max_error(data.target(idx))?);
        }
        Ok(worst)
    }

    /// Output delta, then hidden deltas from the last layer back to the second.
    fn backpropagate(&mut self, buffers: &TrainingBuffers) -> Result<()> {
        let last = self.layers.len() - 1;
        self.layers[last].output_error(buffers.expected, buffers.delta(last), &mut self.backend)?;

        for idx in (1..last).rev() {
            self.layers[idx].backpropagate_error(
                buffers.delta(idx + 1),
                buffers.delta(idx),
                &mut self.backend,
            )?;
        }
        Ok(())
    }

    /// Weight updates from the second layer to the last, each one applied to
    /// the preceding layer's matrix.
    fn update_weights(&mut self, buffers: &TrainingBuffers, learning_rate: f32) -> Result<()> {
        for idx in 1..self.layers.len() {
            let (left, right) = self.layers.split_at_mut(idx);
            let previous = &mut left[idx - 1];
            right[0].update_weights(previous, buffers.delta(idx), learning_rate, &mut self.backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostBackend;
    use approx::assert_relative_eq;

    fn sigmoid(z: f32) -> f32 {
        1.0 / (1.0 + (-z).exp())
    }

    fn uploaded(sizes: &[usize], weights: &[Vec<f32>]) -> Network<HostBackend> {
        let mut net = Network::with_seed(HostBackend::new(), 3);
        for &n in sizes {
            net.create_layer(n).unwrap();
        }
        net.set_weights(weights).unwrap();
        net.upload().unwrap();
        net
    }

    #[test]
    fn config_validation() {
        assert!(TrainConfig::default().validate().is_ok());
        let bad_lr = TrainConfig {
            learning_rate: 0.0,
            ..TrainConfig::default()
        };
        assert!(bad_lr.validate().is_err());
        let bad_conf = TrainConfig {
            confidence: -0.1,
            ..TrainConfig::default()
        };
        assert!(bad_conf.validate().is_err());
        let bad_interval = TrainConfig {
            check_interval: 0,
            ..TrainConfig::default()
        };
        assert!(bad_interval.validate().is_err());
    }

    #[test]
    fn cyclic_and_random_pickers_stay_in_range() {
        let mut cyclic = Picker::new(Sampling::Cyclic);
        let order: Vec<usize> = (0..6).map(|_| cyclic.pick(4)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 0, 1]);

        let mut random = Picker::new(Sampling::Random { seed: 9 });
        assert!((0..100).all(|_| random.pick(4) < 4));
    }

    #[test]
    fn zero_iterations_leaves_weights_untouched() {
        let weights = vec![vec![0.3, 0.0, -0.2, 0.0]];
        let mut net = uploaded(&[1, 1], &weights);
        let data = Dataset::from_rows(&[vec![1.0]], &[vec![0.0]]).unwrap();
        let cfg = TrainConfig {
            max_iterations: 0,
            ..TrainConfig::default()
        };

        let report = net.train(&data, &cfg).unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 0);
        assert!(report.checkpoints.is_empty());
        assert_eq!(net.layers()[0].weights().unwrap(), weights[0].as_slice());
        assert_eq!(net.backend().dispatch_count(), 0);
    }

    #[test]
    fn single_update_matches_delta_rule() {
        let (w, b, x, t, lr) = (0.4_f32, -0.1_f32, 0.8_f32, 1.0_f32, 0.5_f32);
        let mut net = uploaded(&[1, 1], &[vec![w, 0.0, b, 0.0]]);
        let data = Dataset::from_rows(&[vec![x]], &[vec![t]]).unwrap();
        let cfg = TrainConfig {
            learning_rate: lr,
            confidence: 1.0,
            max_iterations: 1,
            ..TrainConfig::default()
        };

        let report = net.train(&data, &cfg).unwrap();
        assert!(!report.converged);
        assert_eq!(report.checkpoints.len(), 1);

        let y = sigmoid(w * x + b);
        let delta = (t - y) * y * (1.0 - y);
        let updated = net.layers()[0].weights().unwrap();
        assert_relative_eq!(updated[0], w + lr * delta * x, epsilon = 1e-6);
        assert_relative_eq!(updated[2], b + lr * delta, epsilon = 1e-6);
        assert_eq!(updated[1], 0.0);
        assert_eq!(updated[3], 0.0);
        assert_eq!(net.layers()[0].values()[1], 1.0);
    }

    #[test]
    fn hidden_layer_delta_uses_pre_update_weights() {
        let (w0, b0, w1, b1) = (0.6_f32, 0.1_f32, -0.7_f32, 0.2_f32);
        let (x, t, lr) = (1.0_f32, 1.0_f32, 0.3_f32);
        let mut net = uploaded(
            &[1, 1, 1],
            &[vec![w0, 0.0, b0, 0.0], vec![w1, 0.0, b1, 0.0]],
        );
        let data = Dataset::from_rows(&[vec![x]], &[vec![t]]).unwrap();
        let cfg = TrainConfig {
            learning_rate: lr,
            confidence: 1.0,
            max_iterations: 1,
            ..TrainConfig::default()
        };
        net.train(&data, &cfg).unwrap();

        let h = sigmoid(w0 * x + b0);
        let o = sigmoid(w1 * h + b1);
        let d_o = (t - o) * o * (1.0 - o);
        let d_h = h * (1.0 - h) * w1 * d_o;

        let first = net.layers()[0].weights().unwrap();
        let second = net.layers()[1].weights().unwrap();
        assert_relative_eq!(second[0], w1 + lr * d_o * h, epsilon = 1e-6);
        assert_relative_eq!(second[2], b1 + lr * d_o, epsilon = 1e-6);
        assert_relative_eq!(first[0], w0 + lr * d_h * x, epsilon = 1e-6);
        assert_relative_eq!(first[2], b0 + lr * d_h, epsilon = 1e-6);
    }

    #[test]
    fn already_fitting_network_converges_at_first_check() {
        // Large positive bias drives the output to ~1 regardless of input.
        let mut net = uploaded(&[1, 1], &[vec![0.0, 0.0, 10.0, 0.0]]);
        let data = Dataset::from_rows(&[vec![0.0], vec![1.0]], &[vec![1.0], vec![1.0]]).unwrap();
        let report = net.train(&data, &TrainConfig::default()).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.checkpoints.len(), 1);
    }

    #[test]
    fn train_rejects_bad_topology_and_shapes() {
        let mut single = Network::with_seed(HostBackend::new(), 0);
        single.create_layer(2).unwrap();
        single.upload().unwrap();
        let data = Dataset::xor();
        assert!(matches!(
            single.train(&data, &TrainConfig::default()),
            Err(Error::InvalidConfig(_))
        ));

        let mut net = Network::with_seed(HostBackend::new(), 0);
        net.create_layer(3).unwrap();
        net.create_layer(1).unwrap();
        assert!(matches!(
            net.train(&data, &TrainConfig::default()),
            Err(Error::InvalidState(_))
        ));
        net.upload().unwrap();
        assert!(matches!(
            net.train(&data, &TrainConfig::default()),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn delta_buffers_match_non_bias_neuron_counts() {
        for sizes in [&[2, 3, 1][..], &[4, 5, 6, 2][..], &[1, 1][..]] {
            let mut net = Network::with_seed(HostBackend::new(), 5);
            for &n in sizes {
                net.create_layer(n).unwrap();
            }
            net.upload().unwrap();

            let buffers = TrainingBuffers::new(&mut net).unwrap();
            assert_eq!(buffers.deltas.len(), sizes.len());
            assert!(buffers.deltas[0].is_none());

            let outputs = *sizes.last().unwrap();
            let mut exact = vec![0.0; outputs];
            let mut longer = vec![0.0; outputs + 1];
            net.backend.read_f32(buffers.expected, &mut exact).unwrap();
            assert!(net.backend.read_f32(buffers.expected, &mut longer).is_err());

            for (idx, &n) in sizes.iter().enumerate().skip(1) {
                // Transfers must cover the whole buffer, so only `n` fits.
                let mut exact = vec![0.0; n];
                let mut longer = vec![0.0; n + 1];
                net.backend.read_f32(buffers.delta(idx), &mut exact).unwrap();
                assert!(net.backend.read_f32(buffers.delta(idx), &mut longer).is_err());
            }
            buffers.release(&mut net.backend).unwrap();
        }
    }

    #[test]
    fn training_buffers_are_released() {
        let mut net = uploaded(&[1, 1], &[vec![0.1, 0.0, 0.1, 0.0]]);
        let live = net.backend().live_buffers();
        let data = Dataset::from_rows(&[vec![1.0]], &[vec![0.0]]).unwrap();
        let cfg = TrainConfig {
            max_iterations: 10,
            confidence: 1.0,
            ..TrainConfig::default()
        };
        net.train(&data, &cfg).unwrap();
        assert_eq!(net.backend().live_buffers(), live);
    }
}
