//! Top-level AC load flow engine.
//!
//! [`AcLoadFlowEngine`] assembles the outer loops selected by the parameters
//! into one root group, runs it against a network and folds the session
//! bookkeeping into an [`AcLoadFlowResult`].
//!
//! ```ignore
//! use acflow_algo::{AcLoadFlowEngine, AcLoadFlowParameters};
//!
//! let engine = AcLoadFlowEngine::new(AcLoadFlowParameters::default())?;
//! let result = engine.run(&mut network)?;
//! println!("{:?} after {} outer iterations", result.status, result.outer_loop_iterations);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use acflow_core::{AcFlowResult, Network, BASE_MVA};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::outer_loop::ac_emulation::{AcEmulationFreezeOuterLoop, AcEmulationOuterLoop};
use crate::outer_loop::area_interchange::AreaInterchangeOuterLoop;
use crate::outer_loop::automation::AutomationSystemOuterLoop;
use crate::outer_loop::distributed_slack::DistributedSlackOuterLoop;
use crate::outer_loop::phase_control::PhaseControlOuterLoop;
use crate::outer_loop::reactive_limits::ReactiveLimitsOuterLoop;
use crate::outer_loop::secondary_voltage::SecondaryVoltageOuterLoop;
use crate::outer_loop::shunt_voltage::{
    IncrementalShuntVoltageOuterLoop, SimpleShuntVoltageOuterLoop,
};
use crate::outer_loop::transformer_reactive::{
    IncrementalTransformerReactivePowerOuterLoop, SimpleTransformerReactivePowerOuterLoop,
};
use crate::outer_loop::transformer_voltage::{
    IncrementalTransformerVoltageOuterLoop, SimpleTransformerVoltageOuterLoop,
};
use crate::outer_loop::voltage_monitoring::VoltageMonitoringOuterLoop;
use crate::outer_loop::{CorrectionUnit, LoopEnv, OuterLoopGroup, OuterLoopStatus, RunningContext};
use crate::parameters::{AcLoadFlowParameters, ControlMode, HvdcFreezeMode};
use crate::sensitivity::{JacobianSensitivity, SensitivityService};
use crate::solver::{NewtonRaphsonSolver, PowerFlowSolver, SolverStatus};

/// Overall outcome of a load flow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcLoadFlowStatus {
    Converged,
    /// The outer-loop iteration ceiling stopped the session
    MaxOuterLoopIterations,
    /// The last nonlinear solve did not converge
    SolverFailed,
    /// An outer loop reported a state it cannot correct
    OuterLoopFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcLoadFlowResult {
    pub status: AcLoadFlowStatus,
    pub solver_status: SolverStatus,
    pub outer_loop_status: OuterLoopStatus,
    pub outer_loop_iterations: usize,
    pub iterations_by_loop: BTreeMap<String, usize>,
    /// Newton updates summed over every solve of the session
    pub solver_iterations: usize,
    pub solve_count: usize,
    /// Slack bus mismatch left by the last solve (p.u.)
    pub slack_bus_active_power_mismatch: f64,
    /// Active power moved by slack or area distribution (p.u.)
    pub distributed_active_power: f64,
}

impl AcLoadFlowResult {
    pub fn is_ok(&self) -> bool {
        self.status == AcLoadFlowStatus::Converged
    }

    fn from_session(outer_loop_status: OuterLoopStatus, running: RunningContext) -> Self {
        let status = if outer_loop_status == OuterLoopStatus::Failed {
            AcLoadFlowStatus::OuterLoopFailed
        } else if !running.last_solve.is_converged() {
            AcLoadFlowStatus::SolverFailed
        } else if outer_loop_status == OuterLoopStatus::Unstable {
            AcLoadFlowStatus::MaxOuterLoopIterations
        } else {
            AcLoadFlowStatus::Converged
        };
        Self {
            status,
            solver_status: running.last_solve.status,
            outer_loop_status,
            outer_loop_iterations: running.outer_loop_total_iterations,
            iterations_by_loop: running.iterations_by_loop,
            solver_iterations: running.solver_total_iterations,
            solve_count: running.solve_count,
            slack_bus_active_power_mismatch: running.last_solve.slack_bus_active_power_mismatch,
            distributed_active_power: running.distributed_active_power,
        }
    }
}

/// Runs load flow sessions with a fixed parameter set and collaborators.
#[derive(Clone)]
pub struct AcLoadFlowEngine {
    parameters: AcLoadFlowParameters,
    solver: Arc<dyn PowerFlowSolver>,
    sensitivity: Arc<dyn SensitivityService>,
}

impl std::fmt::Debug for AcLoadFlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcLoadFlowEngine")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl AcLoadFlowEngine {
    /// Engine with the Newton-Raphson solver and the Jacobian sensitivity service.
    pub fn new(parameters: AcLoadFlowParameters) -> AcFlowResult<Self> {
        parameters.validate()?;
        let solver = NewtonRaphsonSolver::from_parameters(&parameters);
        let sensitivity = JacobianSensitivity::new(parameters.hvdc.ac_emulation);
        Ok(Self {
            parameters,
            solver: Arc::new(solver),
            sensitivity: Arc::new(sensitivity),
        })
    }

    pub fn with_solver(mut self, solver: Arc<dyn PowerFlowSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: Arc<dyn SensitivityService>) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn parameters(&self) -> &AcLoadFlowParameters {
        &self.parameters
    }

    /// Root group of the outer loops enabled by the parameters, in check order.
    pub fn build_outer_loops(&self) -> OuterLoopGroup {
        let p = &self.parameters;
        let vc = &p.voltage_control;
        let mut units = Vec::new();

        if p.area_interchange.enabled {
            units.push(CorrectionUnit::outer_loop(AreaInterchangeOuterLoop::new(
                &p.slack,
                &p.area_interchange,
            )));
        } else if p.slack.distributed_slack {
            units.push(CorrectionUnit::outer_loop(DistributedSlackOuterLoop::new(&p.slack)));
        }
        if vc.secondary_voltage_control {
            units.push(CorrectionUnit::outer_loop(SecondaryVoltageOuterLoop::new(
                vc.secondary_voltage_deadband,
            )));
        }
        if p.reactive_limits.voltage_monitoring {
            units.push(CorrectionUnit::outer_loop(VoltageMonitoringOuterLoop));
        }
        if p.reactive_limits.enabled {
            units.push(CorrectionUnit::outer_loop(ReactiveLimitsOuterLoop::new(
                p.reactive_limits.max_pq_pv_switch,
            )));
        }
        if vc.phase_shifter_control {
            units.push(CorrectionUnit::outer_loop(PhaseControlOuterLoop));
        }
        if vc.transformer_voltage_control {
            units.push(match vc.transformer_mode {
                ControlMode::Simple => {
                    CorrectionUnit::outer_loop(SimpleTransformerVoltageOuterLoop)
                }
                ControlMode::Incremental => CorrectionUnit::outer_loop(
                    IncrementalTransformerVoltageOuterLoop::new(vc.max_tap_shift),
                ),
            });
        }
        if vc.transformer_reactive_power_control {
            units.push(match vc.transformer_mode {
                ControlMode::Simple => {
                    CorrectionUnit::outer_loop(SimpleTransformerReactivePowerOuterLoop)
                }
                ControlMode::Incremental => CorrectionUnit::outer_loop(
                    IncrementalTransformerReactivePowerOuterLoop::new(vc.max_tap_shift),
                ),
            });
        }
        if vc.shunt_voltage_control {
            units.push(match vc.shunt_mode {
                ControlMode::Simple => CorrectionUnit::outer_loop(SimpleShuntVoltageOuterLoop),
                ControlMode::Incremental => CorrectionUnit::outer_loop(
                    IncrementalShuntVoltageOuterLoop::new(vc.max_tap_shift),
                ),
            });
        }
        if p.overload_management {
            units.push(CorrectionUnit::outer_loop(AutomationSystemOuterLoop));
        }
        if p.hvdc.ac_emulation {
            let emulation =
                CorrectionUnit::outer_loop(AcEmulationOuterLoop::new(p.hvdc.max_mode_switch));
            units.push(match p.hvdc.freeze_mode {
                HvdcFreezeMode::None => emulation,
                scope => CorrectionUnit::group(OuterLoopGroup::compensation(
                    "hvdc_ac_emulation",
                    CorrectionUnit::outer_loop(AcEmulationFreezeOuterLoop::new(scope)),
                    vec![emulation],
                )),
            });
        }

        OuterLoopGroup::simple("root", units)
    }

    /// Solve `network` and run the outer loops to a fixed point.
    ///
    /// The network keeps the final state: voltages, flows, switched controls
    /// and moved set-points.
    pub fn run(&self, network: &mut Network) -> AcFlowResult<AcLoadFlowResult> {
        let mut group = self.build_outer_loops();
        info!(
            network = %network.stats(),
            outer_loops = ?group.loop_names(),
            "starting AC load flow"
        );
        let mut running = RunningContext::new();
        let mut env = LoopEnv {
            network,
            sensitivity: self.sensitivity.as_ref(),
            parameters: &self.parameters,
        };
        let outer_loop_status = group.run(&mut running, self.solver.as_ref(), &mut env)?;
        let result = AcLoadFlowResult::from_session(outer_loop_status, running);

        match result.status {
            AcLoadFlowStatus::Converged => info!(
                outer_loop_iterations = result.outer_loop_iterations,
                solver_iterations = result.solver_iterations,
                slack_mismatch_mw = result.slack_bus_active_power_mismatch * BASE_MVA,
                "AC load flow converged"
            ),
            status => warn!(
                ?status,
                solver_status = ?result.solver_status,
                outer_loop_iterations = result.outer_loop_iterations,
                "AC load flow did not converge"
            ),
        }
        Ok(result)
    }

    /// Solve independent networks on the rayon pool.
    #[cfg(feature = "parallel")]
    pub fn run_parallel(&self, networks: &mut [Network]) -> Vec<AcFlowResult<AcLoadFlowResult>> {
        use rayon::prelude::*;
        networks.par_iter_mut().map(|network| self.run(network)).collect()
    }
}

/// Run one session with the default collaborators.
pub fn run(
    network: &mut Network,
    parameters: &AcLoadFlowParameters,
) -> AcFlowResult<AcLoadFlowResult> {
    AcLoadFlowEngine::new(parameters.clone())?.run(network)
}
