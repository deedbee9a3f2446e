//! Test doubles for the solver and sensitivity collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use acflow_core::{AcFlowResult, Network};

use crate::sensitivity::{
    ControlVariable, MonitoredQuantity, SensitivityMatrix, SensitivityRequest, SensitivityService,
};
use crate::solver::{PowerFlowSolver, SolveResult, SolverStatus, VoltageInitializer};

/// Solver that leaves the network untouched and returns a canned result.
pub struct ScriptedSolver {
    status: SolverStatus,
    iterations: usize,
    /// 1-based call that reports `MaxIterationReached` instead
    fail_on_call: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedSolver {
    pub fn converging(iterations: usize) -> Self {
        Self {
            status: SolverStatus::Converged,
            iterations,
            fail_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Converges on every call except the `call`-th.
    pub fn failing_on_call(call: usize, iterations: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::converging(iterations)
        }
    }

    pub fn diverging() -> Self {
        Self {
            status: SolverStatus::MaxIterationReached,
            iterations: 15,
            fail_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PowerFlowSolver for ScriptedSolver {
    fn solve(
        &self,
        _network: &mut Network,
        _initializer: VoltageInitializer,
    ) -> AcFlowResult<SolveResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if self.fail_on_call == Some(call) {
            SolverStatus::MaxIterationReached
        } else {
            self.status
        };
        Ok(SolveResult {
            status,
            iterations: self.iterations,
            slack_bus_active_power_mismatch: 0.0,
        })
    }
}

/// Sensitivity service answering from a lookup table; missing pairs are zero.
#[derive(Default)]
pub struct FixedSensitivity {
    values: HashMap<(ControlVariable, MonitoredQuantity), f64>,
}

impl FixedSensitivity {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        control: ControlVariable,
        monitored: MonitoredQuantity,
        value: f64,
    ) -> Self {
        self.values.insert((control, monitored), value);
        self
    }
}

impl SensitivityService for FixedSensitivity {
    fn compute(
        &self,
        _network: &Network,
        request: &SensitivityRequest,
    ) -> AcFlowResult<SensitivityMatrix> {
        let mut matrix = SensitivityMatrix::zeros(&request.controls, &request.monitored);
        for control in &request.controls {
            for monitored in &request.monitored {
                if let Some(value) = self.values.get(&(*control, *monitored)) {
                    matrix.set(*control, *monitored, *value);
                }
            }
        }
        Ok(matrix)
    }
}
