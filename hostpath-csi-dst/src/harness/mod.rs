//! Simulation harnesses for hostpath-csi.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - Oracle implementations for correctness verification
//! - Action generators for random operation sequences
//! - Statistics tracking

pub mod lifecycle;

pub use lifecycle::{LifecycleAction, LifecycleHarness, LifecycleOracle, LifecycleStats, Outcome};

/// Error type for simulation failures.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("oracle mismatch: {context}")]
    Mismatch { context: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("simulation setup failed: {0}")]
    Setup(#[from] std::io::Error),
}
