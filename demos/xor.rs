use offload_mlp::{Dataset, HostBackend, Network, TrainConfig};

fn main() -> offload_mlp::Result<()> {
    let train = Dataset::xor();

    // 2 -> 4 -> 1, sigmoid everywhere.
    let mut net = Network::with_seed(HostBackend::new(), 0);
    net.create_layer(2)?;
    net.create_layer(4)?;
    net.create_layer(1)?;
    net.upload()?;

    let report = net.train(
        &train,
        &TrainConfig {
            learning_rate: 0.5,
            confidence: 0.9,
            max_iterations: 200_000,
            ..TrainConfig::default()
        },
    )?;

    println!(
        "converged={} iterations={} final_error={:?}",
        report.converged,
        report.iterations,
        report.final_error()
    );

    for i in 0..train.len() {
        let x = train.input(i);
        let y = net.predict(x)?;
        println!("x={x:?} y={:.4} target={:?}", y[0], train.target(i));
    }
    println!("kernel dispatches: {}", net.backend().dispatch_count());

    Ok(())
}
