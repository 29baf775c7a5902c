use offload_mlp::{
    BufferId, ComputeBackend, Dataset, Dispatch, Error, HostBackend, Kernel, MemAccess, Network,
    NetworkSnapshot, Sampling, TrainConfig,
};

/// Wraps the host backend and remembers every kernel it was handed.
#[derive(Default)]
struct Recording {
    inner: HostBackend,
    kernels: Vec<(Kernel, usize)>,
    fail_after: Option<usize>,
}

impl ComputeBackend for Recording {
    fn create_buffer(&mut self, access: MemAccess, byte_len: usize) -> offload_mlp::Result<BufferId> {
        self.inner.create_buffer(access, byte_len)
    }

    fn release_buffer(&mut self, buffer: BufferId) -> offload_mlp::Result<()> {
        self.inner.release_buffer(buffer)
    }

    fn write_bytes(&mut self, buffer: BufferId, data: &[u8]) -> offload_mlp::Result<()> {
        self.inner.write_bytes(buffer, data)
    }

    fn read_bytes(&mut self, buffer: BufferId, out: &mut [u8]) -> offload_mlp::Result<()> {
        self.inner.read_bytes(buffer, out)
    }

    fn enqueue(&mut self, dispatch: Dispatch) -> offload_mlp::Result<()> {
        if self.fail_after == Some(self.kernels.len()) {
            return Err(Error::Device {
                op: "enqueue",
                reason: "injected failure".to_owned(),
            });
        }
        self.kernels.push((dispatch.kernel, dispatch.global_size));
        self.inner.enqueue(dispatch)
    }

    fn finish(&mut self) -> offload_mlp::Result<()> {
        self.inner.finish()
    }
}

fn xor_network(seed: u64) -> Network<HostBackend> {
    let mut net = Network::with_seed(HostBackend::new(), seed);
    net.create_layer(2).unwrap();
    net.create_layer(4).unwrap();
    net.create_layer(1).unwrap();
    net.upload().unwrap();
    net
}

#[test]
fn xor_training_reports_progress() {
    let data = Dataset::xor();
    let mut net = xor_network(0);
    let cfg = TrainConfig {
        learning_rate: 0.5,
        confidence: 0.8,
        max_iterations: 50_000,
        check_interval: 100,
        sampling: Sampling::Cyclic,
    };

    let report = net.train(&data, &cfg).unwrap();
    assert!(report.converged, "xor did not converge: {report:?}");
    assert!(report.iterations < cfg.max_iterations);
    assert_eq!(
        report.checkpoints.len(),
        report.iterations / cfg.check_interval + 1
    );

    let first = report.checkpoints[0];
    let last = report.final_error().unwrap();
    assert!(last <= 0.2 + 1e-6);
    assert!(last < first);
    // Every checkpoint before the last failed the threshold the last one met.
    let (earlier, _) = report.checkpoints.split_at(report.checkpoints.len() - 1);
    assert!(earlier.iter().all(|&e| e > last));

    let half = report.checkpoints.len() / 2;
    if half > 0 {
        let mean = |xs: &[f32]| xs.iter().sum::<f32>() / xs.len() as f32;
        assert!(mean(&report.checkpoints[half..]) < mean(&report.checkpoints[..half]));
    }

    for i in 0..data.len() {
        net.predict(data.input(i)).unwrap();
        assert!(net.has_converged(data.target(i), 0.8).unwrap());
    }
}

#[test]
fn seeded_training_is_reproducible() {
    let data = Dataset::xor();
    let cfg = TrainConfig {
        max_iterations: 500,
        sampling: Sampling::Random { seed: 4 },
        ..TrainConfig::default()
    };

    let mut a = xor_network(7);
    let mut b = xor_network(7);
    let ra = a.train(&data, &cfg).unwrap();
    let rb = b.train(&data, &cfg).unwrap();
    assert_eq!(ra, rb);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn dispatch_order_follows_the_chain() {
    let mut net = Network::with_seed(Recording::default(), 1);
    net.create_layer(3).unwrap();
    net.create_layer(5).unwrap();
    net.create_layer(2).unwrap();
    net.upload().unwrap();

    net.run().unwrap();
    assert_eq!(
        net.backend().kernels,
        vec![(Kernel::Forward, 5), (Kernel::Forward, 2)]
    );

    net.backend_mut().kernels.clear();
    let data = Dataset::from_rows(&[vec![0.1, 0.2, 0.3]], &[vec![1.0, 0.0]]).unwrap();
    let cfg = TrainConfig {
        confidence: 1.0,
        max_iterations: 2,
        check_interval: 10,
        ..TrainConfig::default()
    };
    net.train(&data, &cfg).unwrap();

    let step = [
        (Kernel::Forward, 5),
        (Kernel::Forward, 2),
        (Kernel::OutputError, 2),
        (Kernel::Backpropagate, 5),
        (Kernel::UpdateWeights, 4 * 5),
        (Kernel::UpdateWeights, 6 * 2),
    ];
    // Iteration 0 also runs the check sweep and re-runs the example.
    let mut expected = vec![(Kernel::Forward, 5), (Kernel::Forward, 2)];
    expected.extend_from_slice(&[(Kernel::Forward, 5), (Kernel::Forward, 2)]);
    expected.extend_from_slice(&step);
    expected.extend_from_slice(&step);
    assert_eq!(net.backend().kernels, expected);
}

#[test]
fn device_failure_surfaces_as_device_error() {
    let backend = Recording {
        fail_after: Some(1),
        ..Recording::default()
    };
    let mut net = Network::with_seed(backend, 2);
    net.create_layer(2).unwrap();
    net.create_layer(2).unwrap();
    net.create_layer(1).unwrap();
    net.upload().unwrap();

    let err = net.run().unwrap_err();
    assert!(err.is_device());
}

#[test]
fn trained_weights_survive_a_snapshot() {
    let data = Dataset::xor();
    let mut net = xor_network(3);
    let cfg = TrainConfig {
        max_iterations: 300,
        ..TrainConfig::default()
    };
    net.train(&data, &cfg).unwrap();

    let snapshot: NetworkSnapshot = net.snapshot();
    let mut restored = snapshot.build(HostBackend::new()).unwrap();
    restored.upload().unwrap();
    for i in 0..data.len() {
        assert_eq!(
            restored.predict(data.input(i)).unwrap(),
            net.predict(data.input(i)).unwrap()
        );
    }
}

#[test]
fn failed_training_releases_its_buffers() {
    let backend = Recording {
        fail_after: Some(3),
        ..Recording::default()
    };
    let mut net = Network::with_seed(backend, 5);
    net.create_layer(2).unwrap();
    net.create_layer(4).unwrap();
    net.create_layer(1).unwrap();
    net.upload().unwrap();
    let live = net.backend().inner.live_buffers();

    let err = net
        .train(&Dataset::xor(), &TrainConfig::default())
        .unwrap_err();
    assert!(err.is_device());
    assert_eq!(net.backend().inner.live_buffers(), live);
}
