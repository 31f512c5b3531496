//! Kinematic solving for suspension assemblies
//!
//! This crate provides:
//! - A Levenberg-Marquardt solver over independent assembly components
//! - Immutable solver snapshots for exact restore and replay
//! - Bisection sweeps (`solve_max_v`) and a background sweep worker
//! - `EngineContext`, which ties the model, formulas and solver together

pub mod context;
pub mod snapshot;
pub mod solver;
pub mod sweep;
pub mod worker;

pub use context::{EngineContext, EngineError, EngineResult};
pub use snapshot::SolverSnapshot;
pub use solver::{
    ComponentReport, ComponentStats, KinematicSolver, PoseReport, SolveError, SolveResult,
};
pub use sweep::{
    SweepOutcome, SweepRange, SweepRequest, SweepResponse, SweepSample, SweepSetter, solve_max_v,
};
pub use worker::{SweepEvent, SweepHandle, spawn_sweep};
