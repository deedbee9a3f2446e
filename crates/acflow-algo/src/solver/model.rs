//! Equation system of the AC load flow.
//!
//! Unknowns are bus angles (all but the reference), bus voltage magnitudes
//! and, for enabled continuous controls, transformer ratios, phase shifts and
//! shunt susceptances. Every bus contributes an active power equation (except
//! the reference) and either a reactive power equation or, when it hosts a
//! voltage-controlling generator, the controlled bus voltage equation.
//! Continuous controls add one equation each.
//!
//! Residuals are `calculated - specified`; the Jacobian is assembled densely
//! from analytic per-branch derivatives.

use std::collections::{HashMap, HashSet};

use acflow_core::{
    topology, AcFlowError, AcFlowResult, BranchId, BranchSide, BusId, HvdcLine, Network,
    PhaseControlMode, ShuntId,
};
use faer::Mat;
use num_complex::Complex64;
use tracing::warn;

use super::VoltageInitializer;

/// Build options of a [`PowerFlowModel`].
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Honour HVDC AC emulation (angle-dependent injections)
    pub ac_emulation: bool,
    /// Model enabled ratio/phase/shunt controls as unknowns
    pub continuous_controls: bool,
    /// Buses whose generators are treated as fixed reactive injections
    pub released_buses: HashSet<BusId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    Angle(usize),
    Voltage(usize),
    Ratio(usize),
    PhaseShift(usize),
    Susceptance(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Equation {
    ActivePower(usize),
    ReactivePower(usize),
    BusVoltage { bus: usize, target: f64 },
    BranchActivePower { branch: usize, side: BranchSide, target: f64 },
    BranchReactivePower { branch: usize, side: BranchSide, target: f64 },
}

/// Values of every modelled quantity, unknown or not.
#[derive(Debug, Clone)]
pub struct ModelState {
    pub v: Vec<f64>,
    pub angle: Vec<f64>,
    pub rho: Vec<f64>,
    pub alpha: Vec<f64>,
    pub b: Vec<f64>,
}

impl ModelState {
    pub fn get(&self, var: Variable) -> f64 {
        match var {
            Variable::Angle(i) => self.angle[i],
            Variable::Voltage(i) => self.v[i],
            Variable::Ratio(k) => self.rho[k],
            Variable::PhaseShift(k) => self.alpha[k],
            Variable::Susceptance(s) => self.b[s],
        }
    }

    pub fn add(&mut self, var: Variable, delta: f64) {
        match var {
            Variable::Angle(i) => self.angle[i] += delta,
            Variable::Voltage(i) => self.v[i] += delta,
            Variable::Ratio(k) => self.rho[k] += delta,
            Variable::PhaseShift(k) => self.alpha[k] += delta,
            Variable::Susceptance(s) => self.b[s] += delta,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.v
            .iter()
            .chain(&self.angle)
            .chain(&self.rho)
            .chain(&self.alpha)
            .chain(&self.b)
            .all(|x| x.is_finite())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchAdmittance {
    pub y11: Complex64,
    pub y12: Complex64,
    pub y21: Complex64,
    pub y22: Complex64,
}

#[derive(Debug, Clone)]
pub struct ModelBranch {
    pub id: BranchId,
    pub bus1: usize,
    pub bus2: usize,
    y: Complex64,
    ysh1: Complex64,
    ysh2: Complex64,
}

impl ModelBranch {
    pub fn admittance(&self, rho: f64, alpha: f64) -> BranchAdmittance {
        let shift = Complex64::from_polar(1.0, alpha);
        BranchAdmittance {
            y11: (self.y + self.ysh1) * rho * rho,
            y12: -self.y * shift.conj() * rho,
            y21: -self.y * shift * rho,
            y22: self.y + self.ysh2,
        }
    }

    fn d_rho(&self, rho: f64, alpha: f64) -> BranchAdmittance {
        let shift = Complex64::from_polar(1.0, alpha);
        BranchAdmittance {
            y11: (self.y + self.ysh1) * 2.0 * rho,
            y12: -self.y * shift.conj(),
            y21: -self.y * shift,
            y22: Complex64::new(0.0, 0.0),
        }
    }

    fn d_alpha(&self, rho: f64, alpha: f64) -> BranchAdmittance {
        let shift = Complex64::from_polar(1.0, alpha);
        let j = Complex64::new(0.0, 1.0);
        BranchAdmittance {
            y11: Complex64::new(0.0, 0.0),
            y12: j * self.y * shift.conj() * rho,
            y21: -j * self.y * shift * rho,
            y22: Complex64::new(0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelShunt {
    pub id: ShuntId,
    pub bus: usize,
    pub g: f64,
}

#[derive(Debug, Clone)]
pub struct ModelHvdc {
    pub line: HvdcLine,
    pub bus1: usize,
    pub bus2: usize,
}

/// Power flowing from bus `i` into a branch side with local admittances `yii`, `yij`.
pub fn side_power(
    vi: f64,
    vj: f64,
    ti: f64,
    tj: f64,
    yii: Complex64,
    yij: Complex64,
) -> (f64, f64) {
    let (s, c) = (ti - tj).sin_cos();
    let p = vi * vi * yii.re + vi * vj * (yij.re * c + yij.im * s);
    let q = -vi * vi * yii.im + vi * vj * (yij.re * s - yij.im * c);
    (p, q)
}

/// Branch side power plus its partial derivatives.
///
/// Angle and voltage derivatives are ordered `[own bus, other bus]`; each
/// entry is `(dP, dQ)`.
#[derive(Debug, Clone, Copy)]
pub struct SideTerms {
    pub bus: usize,
    pub other: usize,
    pub p: f64,
    pub q: f64,
    pub d_angle: [(f64, f64); 2],
    pub d_voltage: [(f64, f64); 2],
    pub d_rho: (f64, f64),
    pub d_alpha: (f64, f64),
}

impl SideTerms {
    /// Current magnitude (p.u.) at the side.
    pub fn current(&self, v: f64) -> f64 {
        if v <= 0.0 {
            return 0.0;
        }
        self.p.hypot(self.q) / v
    }
}

/// Reusable equation system for one network island.
#[derive(Debug, Clone)]
pub struct PowerFlowModel {
    pub buses: Vec<BusId>,
    bus_pos: HashMap<BusId, usize>,
    pub reference: usize,
    pub branches: Vec<ModelBranch>,
    branch_pos: HashMap<BranchId, usize>,
    pub shunts: Vec<ModelShunt>,
    shunt_pos: HashMap<ShuntId, usize>,
    pub hvdc: Vec<ModelHvdc>,
    pub p_spec: Vec<f64>,
    pub q_spec: Vec<f64>,
    pub variables: Vec<Variable>,
    pub equations: Vec<Equation>,
    columns: HashMap<Variable, usize>,
    p_rows: Vec<Option<usize>>,
    q_rows: Vec<Option<usize>>,
    voltage_rows: HashMap<usize, usize>,
    /// Buses whose second equation regulates a voltage
    pub controller_buses: Vec<bool>,
    ac_emulation: bool,
    initial: ModelState,
}

impl PowerFlowModel {
    pub fn build(network: &Network, options: &ModelOptions) -> AcFlowResult<Self> {
        let reference_id = choose_reference(network)
            .ok_or_else(|| AcFlowError::Network("network has no enabled bus".into()))?;
        let island = topology::connected_buses(network, reference_id);

        let mut buses = Vec::new();
        let mut bus_pos = HashMap::new();
        let mut initial = ModelState {
            v: Vec::new(),
            angle: Vec::new(),
            rho: Vec::new(),
            alpha: Vec::new(),
            b: Vec::new(),
        };
        for bus in network.buses().filter(|b| island.contains(&b.id)) {
            bus_pos.insert(bus.id, buses.len());
            buses.push(bus.id);
            initial.v.push(if bus.v > 0.0 { bus.v } else { 1.0 });
            initial.angle.push(bus.angle);
        }
        let skipped = network.buses().filter(|b| !b.disabled).count() - buses.len();
        if skipped > 0 {
            warn!(
                skipped,
                reference = %reference_id,
                "buses outside the reference island are not solved"
            );
        }
        let n = buses.len();
        let reference = bus_pos
            .get(&reference_id)
            .copied()
            .ok_or_else(|| {
                AcFlowError::Network(format!("reference bus {reference_id} is disabled"))
            })?;

        let mut branches = Vec::new();
        let mut branch_pos = HashMap::new();
        for branch in network.branches() {
            if branch.disabled {
                continue;
            }
            let (Some(&bus1), Some(&bus2)) =
                (bus_pos.get(&branch.bus1), bus_pos.get(&branch.bus2))
            else {
                continue;
            };
            let z = Complex64::new(branch.r, branch.x);
            if z.norm_sqr() < 1e-12 {
                warn!(branch = %branch.id, "skipping zero impedance branch");
                continue;
            }
            branch_pos.insert(branch.id, branches.len());
            branches.push(ModelBranch {
                id: branch.id,
                bus1,
                bus2,
                y: z.inv(),
                ysh1: Complex64::new(branch.g1, branch.b1),
                ysh2: Complex64::new(branch.g2, branch.b2),
            });
            initial.rho.push(branch.rho);
            initial.alpha.push(branch.alpha);
        }

        let mut shunts = Vec::new();
        let mut shunt_pos = HashMap::new();
        for shunt in network.shunts() {
            let Some(&bus) = bus_pos.get(&shunt.bus) else {
                continue;
            };
            if shunt.disabled {
                continue;
            }
            shunt_pos.insert(shunt.id, shunts.len());
            shunts.push(ModelShunt {
                id: shunt.id,
                bus,
                g: shunt.g,
            });
            initial.b.push(shunt.b);
        }

        let mut hvdc = Vec::new();
        for line in network.hvdc_lines().filter(|l| !l.disabled) {
            if let (Some(&bus1), Some(&bus2)) = (bus_pos.get(&line.bus1), bus_pos.get(&line.bus2)) {
                hvdc.push(ModelHvdc {
                    line: line.clone(),
                    bus1,
                    bus2,
                });
            }
        }

        let mut p_spec = vec![0.0; n];
        let mut q_spec = vec![0.0; n];
        for load in network.loads().filter(|l| !l.disabled) {
            if let Some(&i) = bus_pos.get(&load.bus) {
                p_spec[i] -= load.p;
                q_spec[i] -= load.q;
            }
        }

        // Second equation of every bus: voltage target of the first
        // controller found, reactive balance otherwise
        let mut controlled: HashSet<usize> = HashSet::new();
        let mut second_equation = vec![None; n];
        let mut controller_buses = vec![false; n];
        for (i, bus_id) in buses.iter().enumerate() {
            let released = options.released_buses.contains(bus_id);
            for gen in network.generators().filter(|g| g.bus == *bus_id && !g.disabled) {
                p_spec[i] += gen.target_p;
                let target = match &gen.voltage_control {
                    Some(vc) if gen.is_voltage_controlling() && !released => {
                        bus_pos.get(&vc.controlled_bus).map(|&k| (k, vc.target_v))
                    }
                    _ => None,
                };
                match target {
                    Some((k, target_v))
                        if second_equation[i].is_none() && !controlled.contains(&k) =>
                    {
                        controlled.insert(k);
                        controller_buses[i] = true;
                        second_equation[i] = Some(Equation::BusVoltage {
                            bus: k,
                            target: target_v,
                        });
                    }
                    Some(_) if controller_buses[i] => {}
                    _ => q_spec[i] += gen.target_q,
                }
            }
        }

        let mut variables = Vec::new();
        let mut equations = Vec::new();
        for i in 0..n {
            if i != reference {
                variables.push(Variable::Angle(i));
                equations.push(Equation::ActivePower(i));
            }
        }
        for i in 0..n {
            variables.push(Variable::Voltage(i));
            equations.push(second_equation[i].unwrap_or(Equation::ReactivePower(i)));
        }

        if options.continuous_controls {
            for branch in network.branches() {
                let Some(&k) = branch_pos.get(&branch.id) else {
                    continue;
                };
                if let (Some(vc), Some(_)) = (&branch.voltage_control, &branch.ratio_tap_changer) {
                    if vc.enabled {
                        if let Some(&bus) = bus_pos.get(&vc.controlled_bus) {
                            if controlled.insert(bus) {
                                variables.push(Variable::Ratio(k));
                                equations.push(Equation::BusVoltage { bus, target: vc.target_v });
                            }
                        }
                    }
                }
                if let (Some(rc), Some(_)) =
                    (&branch.reactive_power_control, &branch.ratio_tap_changer)
                {
                    if rc.enabled && !variables.contains(&Variable::Ratio(k)) {
                        if let Some(&controlled_branch) = branch_pos.get(&rc.controlled_branch) {
                            variables.push(Variable::Ratio(k));
                            equations.push(Equation::BranchReactivePower {
                                branch: controlled_branch,
                                side: rc.side,
                                target: rc.target_q,
                            });
                        }
                    }
                }
                if let Some(pc) = &branch.phase_control {
                    if let PhaseControlMode::ActivePowerControl { target_p } = pc.mode {
                        if pc.enabled {
                            variables.push(Variable::PhaseShift(k));
                            equations.push(Equation::BranchActivePower {
                                branch: k,
                                side: pc.side,
                                target: target_p,
                            });
                        }
                    }
                }
            }
            for shunt in network.shunts() {
                let Some(&s) = shunt_pos.get(&shunt.id) else {
                    continue;
                };
                if let Some(vc) = shunt.voltage_control.as_ref().filter(|vc| vc.enabled) {
                    if let Some(&bus) = bus_pos.get(&vc.controlled_bus) {
                        if controlled.insert(bus) {
                            variables.push(Variable::Susceptance(s));
                            equations.push(Equation::BusVoltage { bus, target: vc.target_v });
                        }
                    }
                }
            }
        }

        let columns = variables.iter().enumerate().map(|(c, v)| (*v, c)).collect();
        let mut p_rows = vec![None; n];
        let mut q_rows = vec![None; n];
        let mut voltage_rows = HashMap::new();
        for (row, eq) in equations.iter().enumerate() {
            match *eq {
                Equation::ActivePower(i) => p_rows[i] = Some(row),
                Equation::ReactivePower(i) => q_rows[i] = Some(row),
                Equation::BusVoltage { bus, .. } => {
                    voltage_rows.insert(bus, row);
                }
                _ => {}
            }
        }

        Ok(Self {
            buses,
            bus_pos,
            reference,
            branches,
            branch_pos,
            shunts,
            shunt_pos,
            hvdc,
            p_spec,
            q_spec,
            variables,
            equations,
            columns,
            p_rows,
            q_rows,
            voltage_rows,
            controller_buses,
            ac_emulation: options.ac_emulation,
            initial,
        })
    }

    pub fn size(&self) -> usize {
        self.variables.len()
    }

    pub fn bus_position(&self, id: BusId) -> Option<usize> {
        self.bus_pos.get(&id).copied()
    }

    pub fn branch_position(&self, id: BranchId) -> Option<usize> {
        self.branch_pos.get(&id).copied()
    }

    pub fn shunt_position(&self, id: ShuntId) -> Option<usize> {
        self.shunt_pos.get(&id).copied()
    }

    pub fn column(&self, var: Variable) -> Option<usize> {
        self.columns.get(&var).copied()
    }

    pub fn q_row(&self, bus: usize) -> Option<usize> {
        self.q_rows[bus]
    }

    pub fn p_row(&self, bus: usize) -> Option<usize> {
        self.p_rows[bus]
    }

    pub fn voltage_row(&self, bus: usize) -> Option<usize> {
        self.voltage_rows.get(&bus).copied()
    }

    pub fn initial_state(&self, initializer: VoltageInitializer) -> ModelState {
        let mut state = self.initial.clone();
        if initializer == VoltageInitializer::Uniform {
            state.v.iter_mut().for_each(|v| *v = 1.0);
            state.angle.iter_mut().for_each(|a| *a = 0.0);
            for eq in &self.equations {
                if let Equation::BusVoltage { bus, target } = *eq {
                    state.v[bus] = target;
                }
            }
        }
        state
    }

    /// Power at one branch side and its derivatives.
    pub fn side_terms(&self, state: &ModelState, k: usize, side: BranchSide) -> SideTerms {
        let branch = &self.branches[k];
        let (rho, alpha) = (state.rho[k], state.alpha[k]);
        let adm = branch.admittance(rho, alpha);
        let d_rho = branch.d_rho(rho, alpha);
        let d_alpha = branch.d_alpha(rho, alpha);
        let (i, j, yii, yij, dr, da) = match side {
            BranchSide::One => (
                branch.bus1,
                branch.bus2,
                adm.y11,
                adm.y12,
                (d_rho.y11, d_rho.y12),
                (d_alpha.y11, d_alpha.y12),
            ),
            BranchSide::Two => (
                branch.bus2,
                branch.bus1,
                adm.y22,
                adm.y21,
                (d_rho.y22, d_rho.y21),
                (d_alpha.y22, d_alpha.y21),
            ),
        };
        let (vi, vj, ti, tj) = (state.v[i], state.v[j], state.angle[i], state.angle[j]);
        let (s, c) = (ti - tj).sin_cos();
        let (p, q) = side_power(vi, vj, ti, tj, yii, yij);

        let a = yij.re * c + yij.im * s;
        let b = yij.re * s - yij.im * c;
        SideTerms {
            bus: i,
            other: j,
            p,
            q,
            d_angle: [(-vi * vj * b, vi * vj * a), (vi * vj * b, -vi * vj * a)],
            d_voltage: [
                (2.0 * vi * yii.re + vj * a, -2.0 * vi * yii.im + vj * b),
                (vi * a, vi * b),
            ],
            d_rho: side_power(vi, vj, ti, tj, dr.0, dr.1),
            d_alpha: side_power(vi, vj, ti, tj, da.0, da.1),
        }
    }

    /// Bus injections computed from the state (power leaving each bus into the network).
    pub fn bus_powers(&self, state: &ModelState) -> (Vec<f64>, Vec<f64>) {
        let n = self.buses.len();
        let mut p = vec![0.0; n];
        let mut q = vec![0.0; n];
        for (k, branch) in self.branches.iter().enumerate() {
            let adm = branch.admittance(state.rho[k], state.alpha[k]);
            let (i, j) = (branch.bus1, branch.bus2);
            let (vi, vj, ti, tj) = (state.v[i], state.v[j], state.angle[i], state.angle[j]);
            let (p1, q1) = side_power(vi, vj, ti, tj, adm.y11, adm.y12);
            let (p2, q2) = side_power(vj, vi, tj, ti, adm.y22, adm.y21);
            p[i] += p1;
            q[i] += q1;
            p[j] += p2;
            q[j] += q2;
        }
        for (s, shunt) in self.shunts.iter().enumerate() {
            let v2 = state.v[shunt.bus] * state.v[shunt.bus];
            p[shunt.bus] += shunt.g * v2;
            q[shunt.bus] -= state.b[s] * v2;
        }
        (p, q)
    }

    /// HVDC active power injected at each bus.
    pub fn hvdc_injections(&self, state: &ModelState) -> Vec<f64> {
        let mut injections = vec![0.0; self.buses.len()];
        for link in &self.hvdc {
            let (inj1, inj2) = link.line.injections(
                state.angle[link.bus1],
                state.angle[link.bus2],
                self.ac_emulation,
            );
            injections[link.bus1] += inj1;
            injections[link.bus2] += inj2;
        }
        injections
    }

    pub fn ac_emulation(&self) -> bool {
        self.ac_emulation
    }

    pub fn residual(&self, state: &ModelState) -> Vec<f64> {
        let (p, q) = self.bus_powers(state);
        let hvdc = self.hvdc_injections(state);
        self.equations
            .iter()
            .map(|eq| match *eq {
                Equation::ActivePower(i) => p[i] - self.p_spec[i] - hvdc[i],
                Equation::ReactivePower(i) => q[i] - self.q_spec[i],
                Equation::BusVoltage { bus, target } => state.v[bus] - target,
                Equation::BranchActivePower { branch, side, target } => {
                    self.side_terms(state, branch, side).p - target
                }
                Equation::BranchReactivePower { branch, side, target } => {
                    self.side_terms(state, branch, side).q - target
                }
            })
            .collect()
    }

    /// Active power mismatch left on the reference bus (p.u.).
    pub fn slack_mismatch(&self, state: &ModelState) -> f64 {
        let (p, _) = self.bus_powers(state);
        let hvdc = self.hvdc_injections(state);
        let r = self.reference;
        p[r] - self.p_spec[r] - hvdc[r]
    }

    /// Scatter side derivatives into the row of a P or Q quantity.
    fn scatter_side(
        &self,
        jac: &mut Mat<f64>,
        row: usize,
        terms: &SideTerms,
        k: usize,
        reactive: bool,
    ) {
        let pick = |pair: (f64, f64)| if reactive { pair.1 } else { pair.0 };
        let columns = [
            (Variable::Angle(terms.bus), pick(terms.d_angle[0])),
            (Variable::Angle(terms.other), pick(terms.d_angle[1])),
            (Variable::Voltage(terms.bus), pick(terms.d_voltage[0])),
            (Variable::Voltage(terms.other), pick(terms.d_voltage[1])),
            (Variable::Ratio(k), pick(terms.d_rho)),
            (Variable::PhaseShift(k), pick(terms.d_alpha)),
        ];
        for (var, value) in columns {
            if let Some(col) = self.column(var) {
                jac.write(row, col, jac.read(row, col) + value);
            }
        }
    }

    pub fn jacobian(&self, state: &ModelState) -> Mat<f64> {
        let size = self.size();
        let mut jac = Mat::zeros(size, size);

        for k in 0..self.branches.len() {
            for side in [BranchSide::One, BranchSide::Two] {
                let terms = self.side_terms(state, k, side);
                if let Some(row) = self.p_rows[terms.bus] {
                    self.scatter_side(&mut jac, row, &terms, k, false);
                }
                if let Some(row) = self.q_rows[terms.bus] {
                    self.scatter_side(&mut jac, row, &terms, k, true);
                }
            }
        }

        for (s, shunt) in self.shunts.iter().enumerate() {
            let v = state.v[shunt.bus];
            let Some(v_col) = self.column(Variable::Voltage(shunt.bus)) else {
                continue;
            };
            if let Some(row) = self.p_rows[shunt.bus] {
                jac.write(row, v_col, jac.read(row, v_col) + 2.0 * shunt.g * v);
            }
            if let Some(row) = self.q_rows[shunt.bus] {
                jac.write(row, v_col, jac.read(row, v_col) - 2.0 * state.b[s] * v);
                if let Some(col) = self.column(Variable::Susceptance(s)) {
                    jac.write(row, col, jac.read(row, col) - v * v);
                }
            }
        }

        for link in &self.hvdc {
            let (d1, d2) = self.hvdc_angle_derivative(link, state);
            for (bus, d) in [(link.bus1, d1), (link.bus2, d2)] {
                let Some(row) = self.p_rows[bus] else {
                    continue;
                };
                // injection depends on theta1 - theta2 and enters the residual negated
                if let Some(col) = self.column(Variable::Angle(link.bus1)) {
                    jac.write(row, col, jac.read(row, col) - d);
                }
                if let Some(col) = self.column(Variable::Angle(link.bus2)) {
                    jac.write(row, col, jac.read(row, col) + d);
                }
            }
        }

        for (row, eq) in self.equations.iter().enumerate() {
            match *eq {
                Equation::BusVoltage { bus, .. } => {
                    if let Some(col) = self.column(Variable::Voltage(bus)) {
                        jac.write(row, col, 1.0);
                    }
                }
                Equation::BranchActivePower { branch, side, .. } => {
                    let terms = self.side_terms(state, branch, side);
                    self.scatter_side(&mut jac, row, &terms, branch, false);
                }
                Equation::BranchReactivePower { branch, side, .. } => {
                    let terms = self.side_terms(state, branch, side);
                    self.scatter_side(&mut jac, row, &terms, branch, true);
                }
                _ => {}
            }
        }

        jac
    }

    /// Derivative of both HVDC injections with respect to `theta1 - theta2`.
    fn hvdc_angle_derivative(&self, link: &ModelHvdc, state: &ModelState) -> (f64, f64) {
        let h = 1e-7;
        let (t1, t2) = (state.angle[link.bus1], state.angle[link.bus2]);
        let (a1, a2) = link.line.injections(t1 + h, t2, self.ac_emulation);
        let (b1, b2) = link.line.injections(t1 - h, t2, self.ac_emulation);
        ((a1 - b1) / (2.0 * h), (a2 - b2) / (2.0 * h))
    }
}

/// First slack-flagged bus, else the bus hosting the most generation capacity.
pub(crate) fn choose_reference(network: &Network) -> Option<BusId> {
    if let Some(&bus) = network.slack_buses().first() {
        return Some(bus);
    }
    let mut best: Option<(BusId, f64)> = None;
    for gen in network.generators().filter(|g| !g.disabled) {
        let capacity = if gen.max_p.is_finite() { gen.max_p } else { gen.target_p };
        let enabled_bus = network.bus(gen.bus).is_some_and(|b| !b.disabled);
        if enabled_bus && best.map_or(true, |(_, c)| capacity > c) {
            best = Some((gen.bus, capacity));
        }
    }
    best.map(|(bus, _)| bus)
        .or_else(|| network.buses().find(|b| !b.disabled).map(|b| b.id))
}
