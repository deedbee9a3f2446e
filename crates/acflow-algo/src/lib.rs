//! # acflow-algo: AC load flow with outer-loop controls
//!
//! This crate solves the AC power flow of an [`acflow_core::Network`] and
//! drives the discrete controls around the nonlinear solve until the whole
//! system reaches a fixed point.
//!
//! ## Architecture
//!
//! - **[`solver::PowerFlowSolver`]**: the nonlinear solve, Newton-Raphson by default
//! - **[`sensitivity::SensitivityService`]**: control-to-quantity sensitivities from the Jacobian
//! - **[`outer_loop::OuterLoop`]**: one discrete correction (reactive limits, taps, slack...)
//! - **[`outer_loop::OuterLoopGroup`]**: alternates loop checks and solves
//! - **[`AcLoadFlowEngine`]**: assembles the groups from [`AcLoadFlowParameters`]
//!
//! ## Outer loops
//!
//! | Loop | Corrects |
//! |------|----------|
//! | `distributed_slack` | slack bus mismatch, spread over generators or loads |
//! | `area_interchange_control` | scheduled net export of each area |
//! | `secondary_voltage_control` | pilot bus voltages through generator targets |
//! | `voltage_monitoring` | PQ buses whose voltage left its limits |
//! | `reactive_limits` | generators beyond their reactive capability |
//! | `phase_control` | phase shifter set-points and current limiters |
//! | `*transformer_voltage_control` | regulated bus voltages through ratio taps |
//! | `*transformer_reactive_power_control` | branch reactive flows through ratio taps |
//! | `*shunt_voltage_control` | regulated bus voltages through shunt sections |
//! | `automation_system` | overloads through switching automata |
//! | `ac_emulation` | HVDC links that saturate or leave saturation |
//!
//! ## Example
//!
//! ```ignore
//! use acflow_algo::{AcLoadFlowEngine, AcLoadFlowParameters};
//!
//! let parameters = AcLoadFlowParameters::from_path("loadflow.toml")?;
//! let engine = AcLoadFlowEngine::new(parameters)?;
//! let result = engine.run(&mut network)?;
//! assert!(result.is_ok());
//! ```

pub mod engine;
pub mod outer_loop;
pub mod parameters;
pub mod sensitivity;
pub mod solver;

#[cfg(test)]
mod testing;

pub use engine::{run, AcLoadFlowEngine, AcLoadFlowResult, AcLoadFlowStatus};
pub use outer_loop::{
    CorrectionUnit, LoopEnv, OuterLoop, OuterLoopContext, OuterLoopGroup, OuterLoopStatus,
    RunningContext,
};
pub use parameters::AcLoadFlowParameters;
pub use sensitivity::{JacobianSensitivity, SensitivityService};
pub use solver::{
    NewtonRaphsonSolver, PowerFlowSolver, SolveResult, SolverStatus, VoltageInitializer,
};
