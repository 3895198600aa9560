//! Simulation runners and utilities.
//!
//! Actions run one at a time on a single-threaded runtime, so a run is fully
//! determined by its seed. Blocking filesystem work still happens on the
//! blocking pool.

use hostpath_csi::mount::StageMode;

use crate::harness::{LifecycleHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Run a lifecycle simulation with the given seed and number of operations.
pub async fn run_lifecycle_simulation(
    seed: u64,
    stage_mode: StageMode,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "Lifecycle simulation: seed={}, stage_mode={:?}, ops={}",
        seed, stage_mode, operations
    );

    let mut harness = LifecycleHarness::new(seed, stage_mode)?;
    harness.run(operations).await?;

    let stats = harness.stats();
    eprintln!("Lifecycle simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
