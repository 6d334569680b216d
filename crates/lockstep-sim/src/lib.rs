//! Deterministic fault-injection harness for lockstep.
//!
//! Drives a real state manager on a scratch git repository with seeded
//! operation sequences and injected failures, and checks after every step
//! that the artifact tree, the git history and the store moved together or
//! not at all.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod simulator;

pub use campaign::{CampaignConfig, CampaignReport, SeedFailure, replay_seed, run_campaign};
pub use oracle::{InvariantViolation, OracleResult};
pub use rng::DeterministicRng;
pub use simulator::{
    Fault, FaultConfig, Operation, SimulationConfig, SimulationResult, Simulator, StepOutcome,
    TraceEvent,
};
