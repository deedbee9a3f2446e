//! Newton-Raphson solver adapter.
//!
//! Each call rebuilds the [`PowerFlowModel`] from the network, so control
//! flags flipped by outer loops between two solves are always honoured. The
//! linear system is factorized with faer's partial-pivoting LU.
//!
//! # Example
//!
//! ```ignore
//! use acflow_algo::solver::{NewtonRaphsonSolver, PowerFlowSolver, VoltageInitializer};
//!
//! let solver = NewtonRaphsonSolver::new()
//!     .with_tolerance(1e-8)
//!     .with_max_iterations(20);
//! let result = solver.solve(&mut network, VoltageInitializer::Uniform)?;
//! assert!(result.is_converged());
//! ```

use acflow_core::{AcFlowResult, BranchFlows, BranchSide, Network};
use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use tracing::debug;

use super::model::{ModelOptions, ModelState, PowerFlowModel, Variable};
use super::{PowerFlowSolver, SolveResult, SolverStatus, VoltageInitializer};
use crate::parameters::{AcLoadFlowParameters, NewtonRaphsonParameters};

/// Dense Newton-Raphson solver over the full AC equation system.
#[derive(Debug, Clone)]
pub struct NewtonRaphsonSolver {
    parameters: NewtonRaphsonParameters,
    ac_emulation: bool,
}

impl Default for NewtonRaphsonSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NewtonRaphsonSolver {
    pub fn new() -> Self {
        Self {
            parameters: NewtonRaphsonParameters::default(),
            ac_emulation: true,
        }
    }

    pub fn from_parameters(parameters: &AcLoadFlowParameters) -> Self {
        Self {
            parameters: parameters.newton_raphson.clone(),
            ac_emulation: parameters.hvdc.ac_emulation,
        }
    }

    /// Set convergence tolerance (p.u. mismatch)
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.parameters.tolerance = tolerance;
        self
    }

    /// Set maximum number of Newton updates
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.parameters.max_iterations = max_iterations;
        self
    }

    pub fn with_ac_emulation(mut self, enabled: bool) -> Self {
        self.ac_emulation = enabled;
        self
    }

    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            ac_emulation: self.ac_emulation,
            continuous_controls: true,
            ..ModelOptions::default()
        }
    }

    /// Run Newton iterations in place; returns the status and the number of updates.
    pub fn iterate(&self, model: &PowerFlowModel, state: &mut ModelState) -> (SolverStatus, usize) {
        for iteration in 0..=self.parameters.max_iterations {
            let residual = model.residual(state);
            let max_mismatch = residual.iter().fold(0.0_f64, |m, r| m.max(r.abs()));
            if !max_mismatch.is_finite() {
                return (SolverStatus::SolverFailed, iteration);
            }
            if max_mismatch < self.parameters.tolerance {
                debug!(iteration, max_mismatch, "newton-raphson converged");
                return (SolverStatus::Converged, iteration);
            }
            if iteration == self.parameters.max_iterations {
                debug!(max_mismatch, "newton-raphson reached max iterations");
                return (SolverStatus::MaxIterationReached, iteration);
            }

            let jacobian = model.jacobian(state);
            let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
            let Some(delta) = solve_linear_system_faer(&jacobian, &rhs) else {
                debug!(iteration, "singular jacobian");
                return (SolverStatus::SolverFailed, iteration);
            };
            for (var, dx) in model.variables.iter().zip(&delta) {
                state.add(*var, *dx);
            }
            if !state.is_finite() {
                return (SolverStatus::SolverFailed, iteration + 1);
            }
        }
        (SolverStatus::MaxIterationReached, self.parameters.max_iterations)
    }

    fn is_realistic(&self, state: &ModelState) -> bool {
        state.v.iter().all(|v| {
            *v >= self.parameters.min_realistic_voltage
                && *v <= self.parameters.max_realistic_voltage
        })
    }
}

impl PowerFlowSolver for NewtonRaphsonSolver {
    fn solve(
        &self,
        network: &mut Network,
        initializer: VoltageInitializer,
    ) -> AcFlowResult<SolveResult> {
        let model = PowerFlowModel::build(network, &self.model_options())?;
        let mut state = model.initial_state(initializer);
        let (mut status, iterations) = self.iterate(&model, &mut state);

        if status == SolverStatus::Converged && !self.is_realistic(&state) {
            status = SolverStatus::Unrealistic;
        }
        let slack_bus_active_power_mismatch = if status == SolverStatus::SolverFailed {
            0.0
        } else {
            write_back(&model, &state, network);
            model.slack_mismatch(&state)
        };

        Ok(SolveResult {
            status,
            iterations,
            slack_bus_active_power_mismatch,
        })
    }
}

/// Solve `A x = b` with faer's LU decomposition; `None` when singular.
pub(crate) fn solve_linear_system_faer(a: &Mat<f64>, b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    if n == 0 {
        return Some(Vec::new());
    }
    let mut rhs = Mat::zeros(n, 1);
    for (i, value) in b.iter().enumerate() {
        rhs.write(i, 0, *value);
    }
    let lu = a.partial_piv_lu();
    let solution = lu.solve(&rhs);
    let x: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Copy the solved state into the network: voltages, continuous controls,
/// generator outputs, branch flows and HVDC flows.
fn write_back(model: &PowerFlowModel, state: &ModelState, network: &mut Network) {
    for (i, bus_id) in model.buses.iter().enumerate() {
        if let Some(bus) = network.bus_mut(*bus_id) {
            bus.v = state.v[i];
            bus.angle = state.angle[i];
        }
    }

    for (k, branch) in model.branches.iter().enumerate() {
        let side1 = model.side_terms(state, k, BranchSide::One);
        let side2 = model.side_terms(state, k, BranchSide::Two);
        let Some(target) = network.branch_mut(branch.id) else {
            continue;
        };
        if model.column(Variable::Ratio(k)).is_some() {
            target.rho = state.rho[k];
        }
        if model.column(Variable::PhaseShift(k)).is_some() {
            target.alpha = state.alpha[k];
        }
        target.flows = BranchFlows {
            p1: side1.p,
            q1: side1.q,
            i1: side1.current(state.v[branch.bus1]),
            p2: side2.p,
            q2: side2.q,
            i2: side2.current(state.v[branch.bus2]),
        };
    }
    for branch in network.branches_mut() {
        if branch.disabled {
            branch.flows = BranchFlows::default();
        }
    }

    for (s, shunt) in model.shunts.iter().enumerate() {
        if model.column(Variable::Susceptance(s)).is_some() {
            if let Some(target) = network.shunt_mut(shunt.id) {
                target.b = state.b[s];
            }
        }
    }

    let (_, q_calc) = model.bus_powers(state);
    let slack_mismatch = model.slack_mismatch(state);
    for (i, bus_id) in model.buses.iter().enumerate() {
        let load_q: f64 = network
            .loads()
            .filter(|l| l.bus == *bus_id && !l.disabled)
            .map(|l| l.q)
            .sum();
        let controller = model.controller_buses[i];
        let fixed_q: f64 = network
            .generators()
            .filter(|g| {
                g.bus == *bus_id && !g.disabled && !(controller && g.is_voltage_controlling())
            })
            .map(|g| g.target_q)
            .sum();
        let regulated_q = q_calc[i] + load_q - fixed_q;
        let weights: Vec<(acflow_core::GenId, f64)> = network
            .generators()
            .filter(|g| g.bus == *bus_id && !g.disabled && controller && g.is_voltage_controlling())
            .map(|g| {
                let range = g.max_q - g.min_q;
                (g.id, if range.is_finite() && range > 0.0 { range } else { 1.0 })
            })
            .collect();
        let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
        let at_reference = i == model.reference;
        let reference_gens = network
            .generators()
            .filter(|g| g.bus == *bus_id && !g.disabled)
            .count()
            .max(1) as f64;

        for gen in network.generators_mut().filter(|g| g.bus == *bus_id && !g.disabled) {
            gen.p = gen.target_p;
            if at_reference {
                gen.p += slack_mismatch / reference_gens;
            }
            gen.q = match weights.iter().find(|(id, _)| *id == gen.id) {
                Some((_, w)) => regulated_q * w / total_weight,
                None => gen.target_q,
            };
        }
    }

    for link in &model.hvdc {
        let (inj1, inj2) = link.line.injections(
            state.angle[link.bus1],
            state.angle[link.bus2],
            model.ac_emulation(),
        );
        if let Some(line) = network.hvdc_line_mut(link.line.id) {
            line.p1 = -inj1;
            line.p2 = -inj2;
        }
    }
}
