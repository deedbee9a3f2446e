//! Linearized sensitivities around the last converged state.
//!
//! Discrete outer loops decide how many tap or section steps to take from
//! `d(monitored)/d(control)` values. [`JacobianSensitivity`] computes them
//! with the adjoint method: for each monitored quantity `h` it solves
//! `J^T lambda = dh/dx` once, so a single LU factorization serves every
//! control at once.

use std::collections::{HashMap, HashSet};

use acflow_core::{AcFlowError, AcFlowResult, BranchId, BranchSide, BusId, Network, ShuntId};
use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::solver::model::{ModelOptions, ModelState, PowerFlowModel, SideTerms, Variable};
use crate::solver::VoltageInitializer;

/// Quantity an outer loop can move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlVariable {
    TapRatio(BranchId),
    PhaseShift(BranchId),
    ShuntSusceptance(ShuntId),
    /// Extra reactive injection at a bus with a reactive balance equation
    BusReactiveInjection(BusId),
    /// Voltage target of the generator regulating this bus
    VoltageTarget(BusId),
}

/// Quantity an outer loop observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitoredQuantity {
    BusVoltage(BusId),
    BranchActivePower(BranchId, BranchSide),
    BranchReactivePower(BranchId, BranchSide),
    BranchCurrent(BranchId, BranchSide),
}

#[derive(Debug, Clone, Default)]
pub struct SensitivityRequest {
    pub controls: Vec<ControlVariable>,
    pub monitored: Vec<MonitoredQuantity>,
    /// Buses whose voltage regulation is ignored for this computation
    pub released_buses: HashSet<BusId>,
}

impl SensitivityRequest {
    pub fn new(controls: Vec<ControlVariable>, monitored: Vec<MonitoredQuantity>) -> Self {
        Self {
            controls,
            monitored,
            released_buses: HashSet::new(),
        }
    }

    pub fn with_released_buses(mut self, buses: impl IntoIterator<Item = BusId>) -> Self {
        self.released_buses.extend(buses);
        self
    }
}

/// Dense `monitored x controls` matrix of partial derivatives.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityMatrix {
    controls: HashMap<ControlVariable, usize>,
    monitored: HashMap<MonitoredQuantity, usize>,
    values: Vec<Vec<f64>>,
}

impl SensitivityMatrix {
    pub fn zeros(controls: &[ControlVariable], monitored: &[MonitoredQuantity]) -> Self {
        Self {
            controls: controls.iter().enumerate().map(|(i, c)| (*c, i)).collect(),
            monitored: monitored.iter().enumerate().map(|(i, m)| (*m, i)).collect(),
            values: vec![vec![0.0; controls.len()]; monitored.len()],
        }
    }

    pub fn get(&self, control: ControlVariable, monitored: MonitoredQuantity) -> Option<f64> {
        let c = *self.controls.get(&control)?;
        let m = *self.monitored.get(&monitored)?;
        Some(self.values[m][c])
    }

    pub fn set(&mut self, control: ControlVariable, monitored: MonitoredQuantity, value: f64) {
        if let (Some(&c), Some(&m)) =
            (self.controls.get(&control), self.monitored.get(&monitored))
        {
            self.values[m][c] = value;
        }
    }
}

/// Sensitivity provider consumed by the outer loops.
pub trait SensitivityService: Send + Sync {
    fn compute(
        &self,
        network: &Network,
        request: &SensitivityRequest,
    ) -> AcFlowResult<SensitivityMatrix>;
}

#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error("{0} is not part of the solved network")]
    UnknownElement(String),

    #[error("Jacobian is singular at the current operating point")]
    Singular,
}

impl From<SensitivityError> for AcFlowError {
    fn from(err: SensitivityError) -> Self {
        AcFlowError::Sensitivity(err.to_string())
    }
}

/// Adjoint sensitivities from the load flow Jacobian at the network's stored state.
#[derive(Debug, Clone)]
pub struct JacobianSensitivity {
    ac_emulation: bool,
}

impl Default for JacobianSensitivity {
    fn default() -> Self {
        Self { ac_emulation: true }
    }
}

impl JacobianSensitivity {
    pub fn new(ac_emulation: bool) -> Self {
        Self { ac_emulation }
    }
}

/// Sparse column: (equation row, derivative) pairs.
type Column = Vec<(usize, f64)>;

impl SensitivityService for JacobianSensitivity {
    fn compute(
        &self,
        network: &Network,
        request: &SensitivityRequest,
    ) -> AcFlowResult<SensitivityMatrix> {
        let options = ModelOptions {
            ac_emulation: self.ac_emulation,
            continuous_controls: false,
            released_buses: request.released_buses.clone(),
        };
        let model = PowerFlowModel::build(network, &options)?;
        let state = model.initial_state(VoltageInitializer::Previous);
        let n = model.size();

        // Right-hand sides: gradient of every monitored quantity w.r.t. the unknowns
        let mut gradients = Mat::<f64>::zeros(n, request.monitored.len());
        let mut monitored_terms = Vec::with_capacity(request.monitored.len());
        for (m, quantity) in request.monitored.iter().enumerate() {
            let terms = monitored_terms_of(&model, &state, *quantity)?;
            for (col, value) in gradient_of(&model, *quantity, terms.as_ref(), &state) {
                gradients.write(col, m, gradients.read(col, m) + value);
            }
            monitored_terms.push(terms);
        }

        let control_columns = request
            .controls
            .iter()
            .map(|c| equation_derivatives(&model, &state, *c))
            .collect::<Result<Vec<Column>, SensitivityError>>()?;

        let lambda = if n == 0 {
            Mat::zeros(0, request.monitored.len())
        } else {
            let jacobian = model.jacobian(&state);
            let lu = jacobian.partial_piv_lu();
            lu.solve_transpose(&gradients)
        };

        let mut matrix = SensitivityMatrix::zeros(&request.controls, &request.monitored);
        for (m, quantity) in request.monitored.iter().enumerate() {
            for (c, control) in request.controls.iter().enumerate() {
                let direct = direct_derivative(
                    &model,
                    *control,
                    *quantity,
                    monitored_terms[m].as_ref(),
                    &state,
                );
                let adjoint: f64 = control_columns[c]
                    .iter()
                    .map(|(row, value)| lambda.read(*row, m) * value)
                    .sum();
                let value = direct - adjoint;
                if !value.is_finite() {
                    return Err(SensitivityError::Singular.into());
                }
                matrix.set(*control, *quantity, value);
            }
        }
        debug!(
            controls = request.controls.len(),
            monitored = request.monitored.len(),
            "computed sensitivities"
        );
        Ok(matrix)
    }
}

fn branch_index(model: &PowerFlowModel, id: BranchId) -> Result<usize, SensitivityError> {
    model
        .branch_position(id)
        .ok_or_else(|| SensitivityError::UnknownElement(format!("branch {id}")))
}

fn bus_index(model: &PowerFlowModel, id: BusId) -> Result<usize, SensitivityError> {
    model
        .bus_position(id)
        .ok_or_else(|| SensitivityError::UnknownElement(format!("bus {id}")))
}

fn monitored_terms_of(
    model: &PowerFlowModel,
    state: &ModelState,
    quantity: MonitoredQuantity,
) -> Result<Option<(usize, SideTerms)>, SensitivityError> {
    match quantity {
        MonitoredQuantity::BusVoltage(bus) => {
            bus_index(model, bus)?;
            Ok(None)
        }
        MonitoredQuantity::BranchActivePower(branch, side)
        | MonitoredQuantity::BranchReactivePower(branch, side)
        | MonitoredQuantity::BranchCurrent(branch, side) => {
            let k = branch_index(model, branch)?;
            Ok(Some((k, model.side_terms(state, k, side))))
        }
    }
}

/// Derivative of a branch side quantity, as `(d_p, d_q)` pairs, folded into one value.
fn fold_side(quantity: MonitoredQuantity, terms: &SideTerms, v: f64, pair: (f64, f64)) -> f64 {
    match quantity {
        MonitoredQuantity::BranchActivePower(..) => pair.0,
        MonitoredQuantity::BranchReactivePower(..) => pair.1,
        MonitoredQuantity::BranchCurrent(..) => {
            let s = terms.p.hypot(terms.q);
            if s < 1e-12 || v <= 0.0 {
                0.0
            } else {
                (terms.p * pair.0 + terms.q * pair.1) / (s * v)
            }
        }
        MonitoredQuantity::BusVoltage(_) => 0.0,
    }
}

fn gradient_of(
    model: &PowerFlowModel,
    quantity: MonitoredQuantity,
    terms: Option<&(usize, SideTerms)>,
    state: &ModelState,
) -> Vec<(usize, f64)> {
    let mut entries = Vec::new();
    match (quantity, terms) {
        (MonitoredQuantity::BusVoltage(bus), _) => {
            if let Some(col) = model
                .bus_position(bus)
                .and_then(|i| model.column(Variable::Voltage(i)))
            {
                entries.push((col, 1.0));
            }
        }
        (_, Some((_, terms))) => {
            let v = state.v[terms.bus];
            let mut own_voltage = fold_side(quantity, terms, v, terms.d_voltage[0]);
            if matches!(quantity, MonitoredQuantity::BranchCurrent(..)) && v > 0.0 {
                own_voltage -= terms.p.hypot(terms.q) / (v * v);
            }
            let candidates = [
                (Variable::Angle(terms.bus), fold_side(quantity, terms, v, terms.d_angle[0])),
                (Variable::Angle(terms.other), fold_side(quantity, terms, v, terms.d_angle[1])),
                (Variable::Voltage(terms.bus), own_voltage),
                (Variable::Voltage(terms.other), fold_side(quantity, terms, v, terms.d_voltage[1])),
            ];
            for (var, value) in candidates {
                if let Some(col) = model.column(var) {
                    entries.push((col, value));
                }
            }
        }
        _ => {}
    }
    entries
}

/// Partial derivative of the equation residuals with respect to a control.
fn equation_derivatives(
    model: &PowerFlowModel,
    state: &ModelState,
    control: ControlVariable,
) -> Result<Column, SensitivityError> {
    let mut column = Column::new();
    match control {
        ControlVariable::TapRatio(branch) | ControlVariable::PhaseShift(branch) => {
            let k = branch_index(model, branch)?;
            for side in [BranchSide::One, BranchSide::Two] {
                let terms = model.side_terms(state, k, side);
                let (dp, dq) = match control {
                    ControlVariable::TapRatio(_) => terms.d_rho,
                    _ => terms.d_alpha,
                };
                if let Some(row) = model.p_row(terms.bus) {
                    column.push((row, dp));
                }
                if let Some(row) = model.q_row(terms.bus) {
                    column.push((row, dq));
                }
            }
        }
        ControlVariable::ShuntSusceptance(shunt) => {
            let s = model
                .shunt_position(shunt)
                .ok_or_else(|| SensitivityError::UnknownElement(format!("shunt {shunt}")))?;
            let bus = model.shunts[s].bus;
            if let Some(row) = model.q_row(bus) {
                column.push((row, -state.v[bus] * state.v[bus]));
            }
        }
        ControlVariable::BusReactiveInjection(bus) => {
            let i = bus_index(model, bus)?;
            if let Some(row) = model.q_row(i) {
                column.push((row, -1.0));
            }
        }
        ControlVariable::VoltageTarget(bus) => {
            let i = bus_index(model, bus)?;
            let row = model.voltage_row(i).ok_or_else(|| {
                SensitivityError::UnknownElement(format!("voltage target of bus {bus}"))
            })?;
            column.push((row, -1.0));
        }
    }
    Ok(column)
}

/// Explicit dependence of a monitored quantity on a control.
fn direct_derivative(
    model: &PowerFlowModel,
    control: ControlVariable,
    quantity: MonitoredQuantity,
    terms: Option<&(usize, SideTerms)>,
    state: &ModelState,
) -> f64 {
    let Some((k, terms)) = terms else {
        return 0.0;
    };
    let pair = match control {
        ControlVariable::TapRatio(branch) if model.branch_position(branch) == Some(*k) => {
            terms.d_rho
        }
        ControlVariable::PhaseShift(branch) if model.branch_position(branch) == Some(*k) => {
            terms.d_alpha
        }
        _ => return 0.0,
    };
    fold_side(quantity, terms, state.v[terms.bus], pair)
}
