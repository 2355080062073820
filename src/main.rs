use stress_test::{network_simulation, stress_test_scaling, stress_test_text, StressConfig};
use tracing_subscriber::EnvFilter;
use weft_sync::NetworkConfig;
pub mod stress_test;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new().expect("failed to start the tokio runtime");
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;

    // Test 1: small scale
    let stats = stress_test_text(StressConfig::new(4, 100, 200)).await;
    stats.print();
    all_converged &= stats.converged;

    // Test 2: medium scale
    let stats = stress_test_text(StressConfig::new(10, 500, 1000)).await;
    stats.print();
    all_converged &= stats.converged;

    // Test 3: faulty networks
    for config in [NetworkConfig::lossy(0.3), NetworkConfig::with_dups(0.5), NetworkConfig::chaotic()] {
        all_converged &= network_simulation(5, 300, config, 50).is_some();
    }

    // Test 4: scaling analysis
    stress_test_scaling(12, 4).await;

    if all_converged {
        println!("\n✓ All stress tests completed successfully!");
    } else {
        println!("\n✗ Some replicas failed to converge");
        std::process::exit(1);
    }
}
