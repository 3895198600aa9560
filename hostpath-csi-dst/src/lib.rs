//! Deterministic Simulation Testing (DST) for hostpath-csi.
//!
//! This crate provides testing utilities that are intentionally separate from
//! the main hostpath-csi crate so the fake mounter is never compiled into
//! production binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Simulation harnesses and oracles for correctness verification
//! - `simulation` - Runtime construction and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p hostpath-csi-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p hostpath-csi-dst simulation -- --ignored
//!
//! # Reproduce a failing run
//! DST_SEED=1234 cargo test -p hostpath-csi-dst simulation
//! ```

pub mod harness;
pub mod simulation;

pub use harness::{
    LifecycleAction, LifecycleHarness, LifecycleOracle, LifecycleStats, Outcome, SimulationError,
};
pub use simulation::{build_runtime, get_seed, run_lifecycle_simulation};
