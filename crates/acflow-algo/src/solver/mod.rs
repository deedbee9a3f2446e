//! Nonlinear solver contract used by the outer loops.
//!
//! The engine never looks inside a solve: it hands the network to a
//! [`PowerFlowSolver`] together with a [`VoltageInitializer`] and reads back a
//! [`SolveResult`]. Non-convergence is a status, not an error; `Err` is
//! reserved for malformed input.

use acflow_core::{AcFlowResult, Network};
use serde::{Deserialize, Serialize};

pub mod model;
pub mod newton_raphson;

pub use newton_raphson::NewtonRaphsonSolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverStatus {
    Converged,
    MaxIterationReached,
    /// Singular Jacobian or non-finite state
    SolverFailed,
    /// Converged to voltages outside the realistic range
    Unrealistic,
    /// No solve has been performed yet
    NoCalculation,
}

/// Immutable snapshot of one nonlinear solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub status: SolverStatus,
    /// Number of Newton updates performed
    pub iterations: usize,
    /// Active power the slack bus produces beyond its target (p.u.)
    pub slack_bus_active_power_mismatch: f64,
}

impl SolveResult {
    pub fn not_calculated() -> Self {
        Self {
            status: SolverStatus::NoCalculation,
            iterations: 0,
            slack_bus_active_power_mismatch: 0.0,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == SolverStatus::Converged
    }
}

impl Default for SolveResult {
    fn default() -> Self {
        Self::not_calculated()
    }
}

/// Starting point of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageInitializer {
    /// 1 p.u. and 0 rad everywhere
    Uniform,
    /// Warm start from the voltages stored in the network
    Previous,
}

/// Solver adapter consumed by the outer-loop groups.
///
/// Implementations must be callable repeatedly on the same network and read
/// only shared state, so one instance can serve networks solved in parallel.
pub trait PowerFlowSolver: Send + Sync {
    fn solve(
        &self,
        network: &mut Network,
        initializer: VoltageInitializer,
    ) -> AcFlowResult<SolveResult>;
}
