//! # acflow-core: AC network model
//!
//! Data structures shared by the load flow engine and its outer loops.
//!
//! ## Design
//!
//! Networks are modeled as **undirected multigraphs** where:
//! - **Nodes**: buses, generators, loads, shunts
//! - **Edges**: AC branches (lines and transformers) and HVDC links
//!
//! Generators, loads and shunts reference their bus by id. Lookup tables map
//! every typed id to its graph index so that outer loops can mutate a single
//! device without scanning the graph.
//!
//! All electrical quantities are **per-unit** on [`BASE_MVA`]; angles are in
//! radians. Topology never changes during a load flow session: the engine and
//! its outer loops only flip `disabled`/`enabled` flags, move set-points and
//! change tap positions.
//!
//! ## Quick Start
//!
//! ```rust
//! use acflow_core::*;
//!
//! let mut network = Network::new();
//! network
//!     .add_bus(Bus::new(BusId::new(1), "Bus 1", 138.0).as_slack())
//!     .unwrap();
//! network.add_bus(Bus::new(BusId::new(2), "Bus 2", 138.0)).unwrap();
//! network
//!     .add_generator(
//!         Gen::new(GenId::new(1), "Gen 1", BusId::new(1))
//!             .with_p_limits(0.0, 2.0)
//!             .with_voltage_control(BusId::new(1), 1.02),
//!     )
//!     .unwrap();
//! network
//!     .add_load(Load::new(LoadId::new(1), "Load 1", BusId::new(2), 0.5, 0.1))
//!     .unwrap();
//! network
//!     .add_branch(Branch::new(
//!         BranchId::new(1),
//!         "Line 1-2",
//!         BusId::new(1),
//!         BusId::new(2),
//!         0.01,
//!         0.1,
//!     ))
//!     .unwrap();
//!
//! let stats = network.stats();
//! assert_eq!(stats.num_buses, 2);
//! assert_eq!(stats.num_branches, 1);
//! ```

use petgraph::graph::{EdgeIndex, Graph, NodeIndex};
use petgraph::Undirected;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod controls;
pub mod error;
pub mod topology;
pub mod zones;

pub use controls::*;
pub use error::{AcFlowError, AcFlowResult};
pub use zones::{Area, AreaBoundary, OverloadManagementSystem, VoltageControlZone};

/// System MVA base used for every per-unit quantity.
pub const BASE_MVA: f64 = 100.0;

macro_rules! typed_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(usize);

            impl $name {
                #[inline]
                pub fn new(value: usize) -> Self {
                    $name(value)
                }
                #[inline]
                pub fn value(&self) -> usize {
                    self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

// Newtype wrappers for IDs for type safety
typed_id!(BusId, BranchId, GenId, LoadId, ShuntId, HvdcId, AreaId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Nominal voltage (kV)
    pub nominal_kv: f64,
    /// Voltage magnitude (p.u.)
    pub v: f64,
    /// Voltage angle (rad)
    pub angle: f64,
    pub min_v: Option<f64>,
    pub max_v: Option<f64>,
    pub area: Option<AreaId>,
    /// Candidate reference bus
    pub slack: bool,
    pub disabled: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            nominal_kv: 0.0,
            v: 1.0,
            angle: 0.0,
            min_v: None,
            max_v: None,
            area: None,
            slack: false,
            disabled: false,
        }
    }
}

impl Bus {
    pub fn new(id: BusId, name: impl Into<String>, nominal_kv: f64) -> Self {
        Self {
            id,
            name: name.into(),
            nominal_kv,
            ..Self::default()
        }
    }

    pub fn as_slack(mut self) -> Self {
        self.slack = true;
        self
    }

    pub fn with_voltage_limits(mut self, min_v: f64, max_v: f64) -> Self {
        self.min_v = Some(min_v);
        self.max_v = Some(max_v);
        self
    }

    pub fn in_area(mut self, area: AreaId) -> Self {
        self.area = Some(area);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Active power target (p.u.)
    pub target_p: f64,
    /// Reactive power target when not controlling voltage (p.u.)
    pub target_q: f64,
    pub min_p: f64,
    pub max_p: f64,
    pub min_q: f64,
    pub max_q: f64,
    /// Active power output computed by the last solve (p.u.)
    pub p: f64,
    /// Reactive power output computed by the last solve (p.u.)
    pub q: f64,
    pub voltage_control: Option<GeneratorVoltageControl>,
    /// Weight in active power distribution
    pub participation_factor: f64,
    pub participating: bool,
    pub disabled: bool,
}

impl Default for Gen {
    fn default() -> Self {
        Self {
            id: GenId(0),
            name: String::new(),
            bus: BusId(0),
            target_p: 0.0,
            target_q: 0.0,
            min_p: 0.0,
            max_p: f64::INFINITY,
            min_q: f64::NEG_INFINITY,
            max_q: f64::INFINITY,
            p: 0.0,
            q: 0.0,
            voltage_control: None,
            participation_factor: 1.0,
            participating: true,
            disabled: false,
        }
    }
}

impl Gen {
    /// Create a new generator with default limits (no constraints)
    pub fn new(id: GenId, name: impl Into<String>, bus: BusId) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            ..Self::default()
        }
    }

    pub fn with_target_p(mut self, target_p: f64) -> Self {
        self.target_p = target_p;
        self
    }

    pub fn with_target_q(mut self, target_q: f64) -> Self {
        self.target_q = target_q;
        self
    }

    /// Set active power limits (p.u.)
    pub fn with_p_limits(mut self, min_p: f64, max_p: f64) -> Self {
        self.min_p = min_p;
        self.max_p = max_p;
        self
    }

    /// Set reactive power limits (p.u.)
    pub fn with_q_limits(mut self, min_q: f64, max_q: f64) -> Self {
        self.min_q = min_q;
        self.max_q = max_q;
        self
    }

    /// Regulate the voltage of `controlled_bus` (local when it is the generator bus).
    pub fn with_voltage_control(mut self, controlled_bus: BusId, target_v: f64) -> Self {
        self.voltage_control = Some(GeneratorVoltageControl {
            controlled_bus,
            target_v,
            enabled: true,
        });
        self
    }

    pub fn with_participation(mut self, participating: bool, factor: f64) -> Self {
        self.participating = participating;
        self.participation_factor = factor;
        self
    }

    /// True if the generator currently regulates a voltage.
    pub fn is_voltage_controlling(&self) -> bool {
        !self.disabled && self.voltage_control.as_ref().is_some_and(|vc| vc.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
    /// Active power consumption (p.u.)
    pub p: f64,
    /// Reactive power consumption (p.u.)
    pub q: f64,
    pub participating: bool,
    pub disabled: bool,
}

impl Load {
    pub fn new(id: LoadId, name: impl Into<String>, bus: BusId, p: f64, q: f64) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            p,
            q,
            participating: true,
            disabled: false,
        }
    }
}

/// Shunt compensator; positive `b` injects reactive power.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shunt {
    pub id: ShuntId,
    pub name: String,
    pub bus: BusId,
    /// Conductance (p.u.)
    pub g: f64,
    /// Susceptance (p.u.), continuous while voltage control is enabled
    pub b: f64,
    /// Susceptance of each discrete section position
    pub sections: Option<TapChanger>,
    pub voltage_control: Option<ShuntVoltageControl>,
    pub disabled: bool,
}

impl Shunt {
    pub fn new(id: ShuntId, name: impl Into<String>, bus: BusId, g: f64, b: f64) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            g,
            b,
            sections: None,
            voltage_control: None,
            disabled: false,
        }
    }

    pub fn with_sections(mut self, sections: TapChanger) -> Self {
        self.b = sections.value();
        self.sections = Some(sections);
        self
    }

    pub fn with_voltage_control(
        mut self,
        controlled_bus: BusId,
        target_v: f64,
        deadband: f64,
    ) -> Self {
        self.voltage_control = Some(ShuntVoltageControl {
            controlled_bus,
            target_v,
            deadband,
            enabled: true,
        });
        self
    }

    /// Snap the susceptance to the closest section; returns true if it moved.
    pub fn round_to_section(&mut self) -> bool {
        let Some(sections) = self.sections.as_mut() else {
            return false;
        };
        sections.position = sections.nearest_position(self.b);
        let rounded = sections.value();
        let moved = (rounded - self.b).abs() > 1e-12;
        self.b = rounded;
        moved
    }

    /// Move one section in `direction`; returns the susceptance change.
    pub fn step_section(&mut self, direction: Direction) -> Option<f64> {
        let sections = self.sections.as_mut()?;
        let delta = sections.step(direction)?;
        self.b = sections.value();
        Some(delta)
    }
}

/// Power flows at both branch ends, oriented from the bus into the branch (p.u.).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchFlows {
    pub p1: f64,
    pub q1: f64,
    pub i1: f64,
    pub p2: f64,
    pub q2: f64,
    pub i2: f64,
}

impl BranchFlows {
    pub fn p(&self, side: BranchSide) -> f64 {
        match side {
            BranchSide::One => self.p1,
            BranchSide::Two => self.p2,
        }
    }

    pub fn q(&self, side: BranchSide) -> f64 {
        match side {
            BranchSide::One => self.q1,
            BranchSide::Two => self.q2,
        }
    }

    pub fn i(&self, side: BranchSide) -> f64 {
        match side {
            BranchSide::One => self.i1,
            BranchSide::Two => self.i2,
        }
    }
}

/// AC branch in pi model with an ideal transformer (`rho`, `alpha`) on side 1.
///
/// The side-1 voltage seen by the series element is `rho * e^{j alpha} * V1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub bus1: BusId,
    pub bus2: BusId,
    /// Series resistance (p.u.)
    pub r: f64,
    /// Series reactance (p.u.)
    pub x: f64,
    pub g1: f64,
    pub b1: f64,
    pub g2: f64,
    pub b2: f64,
    /// Ratio, continuous while a ratio control is enabled
    pub rho: f64,
    /// Phase shift (rad), continuous while an active power control is enabled
    pub alpha: f64,
    pub ratio_tap_changer: Option<TapChanger>,
    pub phase_tap_changer: Option<TapChanger>,
    pub voltage_control: Option<TransformerVoltageControl>,
    pub reactive_power_control: Option<TransformerReactivePowerControl>,
    pub phase_control: Option<PhaseControl>,
    pub disabled: bool,
    pub flows: BranchFlows,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            bus1: BusId(0),
            bus2: BusId(0),
            r: 0.0,
            x: 0.0,
            g1: 0.0,
            b1: 0.0,
            g2: 0.0,
            b2: 0.0,
            rho: 1.0,
            alpha: 0.0,
            ratio_tap_changer: None,
            phase_tap_changer: None,
            voltage_control: None,
            reactive_power_control: None,
            phase_control: None,
            disabled: false,
            flows: BranchFlows::default(),
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: impl Into<String>,
        bus1: BusId,
        bus2: BusId,
        r: f64,
        x: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            bus1,
            bus2,
            r,
            x,
            ..Self::default()
        }
    }

    /// Total line charging, split half/half between the two sides.
    pub fn with_charging(mut self, b: f64) -> Self {
        self.b1 = b / 2.0;
        self.b2 = b / 2.0;
        self
    }

    pub fn with_ratio_tap_changer(mut self, tap: TapChanger) -> Self {
        self.rho = tap.value();
        self.ratio_tap_changer = Some(tap);
        self
    }

    pub fn with_phase_tap_changer(mut self, tap: TapChanger) -> Self {
        self.alpha = tap.value();
        self.phase_tap_changer = Some(tap);
        self
    }

    pub fn with_voltage_control(
        mut self,
        controlled_bus: BusId,
        target_v: f64,
        deadband: f64,
    ) -> Self {
        self.voltage_control = Some(TransformerVoltageControl {
            controlled_bus,
            target_v,
            deadband,
            enabled: true,
        });
        self
    }

    pub fn with_reactive_power_control(
        mut self,
        controlled_branch: BranchId,
        side: BranchSide,
        target_q: f64,
        deadband: f64,
    ) -> Self {
        self.reactive_power_control = Some(TransformerReactivePowerControl {
            controlled_branch,
            side,
            target_q,
            deadband,
            enabled: true,
        });
        self
    }

    pub fn with_phase_control(mut self, mode: PhaseControlMode, side: BranchSide) -> Self {
        self.phase_control = Some(PhaseControl {
            mode,
            side,
            enabled: true,
        });
        self
    }

    pub fn bus(&self, side: BranchSide) -> BusId {
        match side {
            BranchSide::One => self.bus1,
            BranchSide::Two => self.bus2,
        }
    }

    /// Snap `rho` to the closest ratio tap; returns true if it moved.
    pub fn round_ratio_to_tap(&mut self) -> bool {
        let Some(tap) = self.ratio_tap_changer.as_mut() else {
            return false;
        };
        tap.position = tap.nearest_position(self.rho);
        let rounded = tap.value();
        let moved = (rounded - self.rho).abs() > 1e-12;
        self.rho = rounded;
        moved
    }

    /// Snap `alpha` to the closest phase tap; returns true if it moved.
    pub fn round_phase_to_tap(&mut self) -> bool {
        let Some(tap) = self.phase_tap_changer.as_mut() else {
            return false;
        };
        tap.position = tap.nearest_position(self.alpha);
        let rounded = tap.value();
        let moved = (rounded - self.alpha).abs() > 1e-12;
        self.alpha = rounded;
        moved
    }

    /// Move the ratio tap one position; returns the ratio change.
    pub fn step_ratio(&mut self, direction: Direction) -> Option<f64> {
        let tap = self.ratio_tap_changer.as_mut()?;
        let delta = tap.step(direction)?;
        self.rho = tap.value();
        Some(delta)
    }

    /// Move the phase tap one position; returns the angle change.
    pub fn step_phase(&mut self, direction: Direction) -> Option<f64> {
        let tap = self.phase_tap_changer.as_mut()?;
        let delta = tap.step(direction)?;
        self.alpha = tap.value();
        Some(delta)
    }
}

/// Power received at the far end of an HVDC link sending `sent` (p.u., >= 0).
///
/// Converter losses are proportional to the power crossing each station; the
/// DC line loss is `R * I^2` with `I` derived from the nominal DC voltage.
pub fn hvdc_received_power(
    sent: f64,
    r_ohm: f64,
    nominal_v_kv: f64,
    loss_factor_sending: f64,
    loss_factor_receiving: f64,
) -> f64 {
    let after_converter = sent * (1.0 - loss_factor_sending);
    let current_ka = after_converter * BASE_MVA / nominal_v_kv;
    let line_loss = r_ohm * current_ka * current_ka / BASE_MVA;
    (after_converter - line_loss) * (1.0 - loss_factor_receiving)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvdcLine {
    pub id: HvdcId,
    pub name: String,
    pub bus1: BusId,
    pub bus2: BusId,
    /// Active power set-point, positive from side 1 to side 2 (p.u.)
    pub p_setpoint: f64,
    /// DC line resistance (ohm)
    pub r: f64,
    /// Nominal DC voltage (kV)
    pub nominal_v: f64,
    pub loss_factor1: f64,
    pub loss_factor2: f64,
    /// Maximum power from side 1 to side 2 (p.u.)
    pub p_max_12: f64,
    /// Maximum power from side 2 to side 1 (p.u.)
    pub p_max_21: f64,
    pub ac_emulation: Option<AcEmulation>,
    /// Active power withdrawn from the AC network at side 1 (p.u.)
    pub p1: f64,
    /// Active power withdrawn from the AC network at side 2 (p.u.)
    pub p2: f64,
    pub disabled: bool,
}

impl HvdcLine {
    pub fn new(
        id: HvdcId,
        name: impl Into<String>,
        bus1: BusId,
        bus2: BusId,
        p_setpoint: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            bus1,
            bus2,
            p_setpoint,
            r: 0.0,
            nominal_v: 400.0,
            loss_factor1: 0.0,
            loss_factor2: 0.0,
            p_max_12: f64::INFINITY,
            p_max_21: f64::INFINITY,
            ac_emulation: None,
            p1: 0.0,
            p2: 0.0,
            disabled: false,
        }
    }

    pub fn with_losses(
        mut self,
        r_ohm: f64,
        nominal_v_kv: f64,
        loss_factor1: f64,
        loss_factor2: f64,
    ) -> Self {
        self.r = r_ohm;
        self.nominal_v = nominal_v_kv;
        self.loss_factor1 = loss_factor1;
        self.loss_factor2 = loss_factor2;
        self
    }

    pub fn with_p_max(mut self, p_max_12: f64, p_max_21: f64) -> Self {
        self.p_max_12 = p_max_12;
        self.p_max_21 = p_max_21;
        self
    }

    pub fn with_ac_emulation(mut self, p0: f64, droop: f64) -> Self {
        self.ac_emulation = Some(AcEmulation::new(p0, droop));
        self
    }

    /// Power sent from side 1 (negative when flowing from side 2).
    pub fn sent_power(&self, angle1: f64, angle2: f64, ac_emulation: bool) -> f64 {
        match &self.ac_emulation {
            Some(emulation) if ac_emulation => match emulation.status {
                AcEmulationStatus::Linear => emulation.linear_flow(angle1, angle2),
                _ => emulation.fixed_p,
            },
            _ => self.p_setpoint,
        }
    }

    /// Power received at the opposite end for a signed sent power.
    pub fn received_power(&self, sent: f64) -> f64 {
        if sent >= 0.0 {
            hvdc_received_power(sent, self.r, self.nominal_v, self.loss_factor1, self.loss_factor2)
        } else {
            hvdc_received_power(-sent, self.r, self.nominal_v, self.loss_factor2, self.loss_factor1)
        }
    }

    /// Active power injected into the AC network at (side 1, side 2).
    pub fn injections(&self, angle1: f64, angle2: f64, ac_emulation: bool) -> (f64, f64) {
        let sent = self.sent_power(angle1, angle2, ac_emulation);
        let received = self.received_power(sent);
        if sent >= 0.0 {
            (-sent, received)
        } else {
            (received, sent)
        }
    }
}

// Enum to represent different types of nodes in the graph
#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Load(Load),
    Shunt(Shunt),
}

// Enum to represent different types of edges in the graph
#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
    Hvdc(HvdcLine),
}

impl Node {
    /// Returns a human-readable label for the node.
    pub fn label(&self) -> &str {
        match self {
            Node::Bus(bus) => &bus.name,
            Node::Gen(gen) => &gen.name,
            Node::Load(load) => &load.name,
            Node::Shunt(shunt) => &shunt.name,
        }
    }
}

impl Edge {
    /// Returns a human-readable label for the edge.
    pub fn label(&self) -> &str {
        match self {
            Edge::Branch(branch) => &branch.name,
            Edge::Hvdc(line) => &line.name,
        }
    }
}

/// The AC network graph plus the control-area and automaton data around it.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: Graph<Node, Edge, Undirected>,
    pub areas: Vec<Area>,
    pub voltage_control_zones: Vec<VoltageControlZone>,
    pub overload_management_systems: Vec<OverloadManagementSystem>,
    bus_index: HashMap<BusId, NodeIndex>,
    gen_index: HashMap<GenId, NodeIndex>,
    load_index: HashMap<LoadId, NodeIndex>,
    shunt_index: HashMap<ShuntId, NodeIndex>,
    branch_index: HashMap<BranchId, EdgeIndex>,
    hvdc_index: HashMap<HvdcId, EdgeIndex>,
}

macro_rules! node_accessors {
    (
        $get:ident,
        $get_mut:ident,
        $iter:ident,
        $iter_mut:ident,
        $variant:ident,
        $ty:ty,
        $id:ty,
        $index:ident $(,)?
    ) => {
        pub fn $get(&self, id: $id) -> Option<&$ty> {
            let idx = *self.$index.get(&id)?;
            match &self.graph[idx] {
                Node::$variant(element) => Some(element),
                _ => None,
            }
        }

        pub fn $get_mut(&mut self, id: $id) -> Option<&mut $ty> {
            let idx = *self.$index.get(&id)?;
            match &mut self.graph[idx] {
                Node::$variant(element) => Some(element),
                _ => None,
            }
        }

        pub fn $iter(&self) -> impl Iterator<Item = &$ty> {
            self.graph.node_weights().filter_map(|n| match n {
                Node::$variant(element) => Some(element),
                _ => None,
            })
        }

        pub fn $iter_mut(&mut self) -> impl Iterator<Item = &mut $ty> {
            self.graph.node_weights_mut().filter_map(|n| match n {
                Node::$variant(element) => Some(element),
                _ => None,
            })
        }
    };
}

macro_rules! edge_accessors {
    (
        $get:ident,
        $get_mut:ident,
        $iter:ident,
        $iter_mut:ident,
        $variant:ident,
        $ty:ty,
        $id:ty,
        $index:ident $(,)?
    ) => {
        pub fn $get(&self, id: $id) -> Option<&$ty> {
            let idx = *self.$index.get(&id)?;
            match &self.graph[idx] {
                Edge::$variant(element) => Some(element),
                _ => None,
            }
        }

        pub fn $get_mut(&mut self, id: $id) -> Option<&mut $ty> {
            let idx = *self.$index.get(&id)?;
            match &mut self.graph[idx] {
                Edge::$variant(element) => Some(element),
                _ => None,
            }
        }

        pub fn $iter(&self) -> impl Iterator<Item = &$ty> {
            self.graph.edge_weights().filter_map(|e| match e {
                Edge::$variant(element) => Some(element),
                _ => None,
            })
        }

        pub fn $iter_mut(&mut self) -> impl Iterator<Item = &mut $ty> {
            self.graph.edge_weights_mut().filter_map(|e| match e {
                Edge::$variant(element) => Some(element),
                _ => None,
            })
        }
    };
}

impl Network {
    pub fn new() -> Self {
        Self {
            graph: Graph::new_undirected(),
            ..Self::default()
        }
    }

    pub fn add_bus(&mut self, bus: Bus) -> AcFlowResult<NodeIndex> {
        if self.bus_index.contains_key(&bus.id) {
            return Err(AcFlowError::Network(format!("duplicate bus id {}", bus.id)));
        }
        let id = bus.id;
        let idx = self.graph.add_node(Node::Bus(bus));
        self.bus_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_generator(&mut self, gen: Gen) -> AcFlowResult<NodeIndex> {
        if self.gen_index.contains_key(&gen.id) {
            return Err(AcFlowError::Network(format!("duplicate generator id {}", gen.id)));
        }
        self.require_bus(gen.bus, &gen.name)?;
        if let Some(vc) = &gen.voltage_control {
            self.require_bus(vc.controlled_bus, &gen.name)?;
        }
        let id = gen.id;
        let idx = self.graph.add_node(Node::Gen(gen));
        self.gen_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_load(&mut self, load: Load) -> AcFlowResult<NodeIndex> {
        if self.load_index.contains_key(&load.id) {
            return Err(AcFlowError::Network(format!("duplicate load id {}", load.id)));
        }
        self.require_bus(load.bus, &load.name)?;
        let id = load.id;
        let idx = self.graph.add_node(Node::Load(load));
        self.load_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_shunt(&mut self, shunt: Shunt) -> AcFlowResult<NodeIndex> {
        if self.shunt_index.contains_key(&shunt.id) {
            return Err(AcFlowError::Network(format!("duplicate shunt id {}", shunt.id)));
        }
        self.require_bus(shunt.bus, &shunt.name)?;
        if let Some(vc) = &shunt.voltage_control {
            self.require_bus(vc.controlled_bus, &shunt.name)?;
        }
        let id = shunt.id;
        let idx = self.graph.add_node(Node::Shunt(shunt));
        self.shunt_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_branch(&mut self, branch: Branch) -> AcFlowResult<EdgeIndex> {
        if self.branch_index.contains_key(&branch.id) {
            return Err(AcFlowError::Network(format!("duplicate branch id {}", branch.id)));
        }
        let a = self.require_bus(branch.bus1, &branch.name)?;
        let b = self.require_bus(branch.bus2, &branch.name)?;
        if let Some(vc) = &branch.voltage_control {
            self.require_bus(vc.controlled_bus, &branch.name)?;
        }
        let id = branch.id;
        let idx = self.graph.add_edge(a, b, Edge::Branch(branch));
        self.branch_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_hvdc_line(&mut self, line: HvdcLine) -> AcFlowResult<EdgeIndex> {
        if self.hvdc_index.contains_key(&line.id) {
            return Err(AcFlowError::Network(format!("duplicate HVDC line id {}", line.id)));
        }
        let a = self.require_bus(line.bus1, &line.name)?;
        let b = self.require_bus(line.bus2, &line.name)?;
        let id = line.id;
        let idx = self.graph.add_edge(a, b, Edge::Hvdc(line));
        self.hvdc_index.insert(id, idx);
        Ok(idx)
    }

    fn require_bus(&self, bus: BusId, owner: &str) -> AcFlowResult<NodeIndex> {
        self.bus_index
            .get(&bus)
            .copied()
            .ok_or_else(|| AcFlowError::Network(format!("'{owner}' references unknown bus {bus}")))
    }

    pub fn bus_node(&self, id: BusId) -> Option<NodeIndex> {
        self.bus_index.get(&id).copied()
    }

    node_accessors!(bus, bus_mut, buses, buses_mut, Bus, Bus, BusId, bus_index);
    node_accessors!(
        generator,
        generator_mut,
        generators,
        generators_mut,
        Gen,
        Gen,
        GenId,
        gen_index,
    );
    node_accessors!(load, load_mut, loads, loads_mut, Load, Load, LoadId, load_index);
    node_accessors!(shunt, shunt_mut, shunts, shunts_mut, Shunt, Shunt, ShuntId, shunt_index);
    edge_accessors!(
        branch,
        branch_mut,
        branches,
        branches_mut,
        Branch,
        Branch,
        BranchId,
        branch_index,
    );
    edge_accessors!(
        hvdc_line,
        hvdc_line_mut,
        hvdc_lines,
        hvdc_lines_mut,
        Hvdc,
        HvdcLine,
        HvdcId,
        hvdc_index,
    );

    /// Find generators at a specific bus
    pub fn generators_at_bus(&self, bus_id: BusId) -> Vec<&Gen> {
        self.generators().filter(|g| g.bus == bus_id).collect()
    }

    /// Find loads at a specific bus
    pub fn loads_at_bus(&self, bus_id: BusId) -> Vec<&Load> {
        self.loads().filter(|l| l.bus == bus_id).collect()
    }

    /// Buses flagged as reference candidates, in insertion order.
    pub fn slack_buses(&self) -> Vec<BusId> {
        self.buses()
            .filter(|b| b.slack && !b.disabled)
            .map(|b| b.id)
            .collect()
    }

    pub fn area(&self, id: AreaId) -> Option<&Area> {
        self.areas.iter().find(|a| a.id == id)
    }

    /// Get total active power generation target (p.u.)
    pub fn total_generation_target(&self) -> f64 {
        self.generators()
            .filter(|g| !g.disabled)
            .map(|g| g.target_p)
            .sum()
    }

    /// Get total active power load (p.u.)
    pub fn total_load(&self) -> f64 {
        self.loads().filter(|l| !l.disabled).map(|l| l.p).sum()
    }

    /// Compute basic statistics about the network
    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();

        for node in self.graph.node_weights() {
            match node {
                Node::Bus(_) => stats.num_buses += 1,
                Node::Gen(g) => {
                    stats.num_gens += 1;
                    if g.voltage_control.is_some() {
                        stats.num_voltage_controllers += 1;
                    }
                }
                Node::Load(l) => {
                    stats.num_loads += 1;
                    stats.total_load_p += l.p;
                }
                Node::Shunt(_) => stats.num_shunts += 1,
            }
        }
        for edge in self.graph.edge_weights() {
            match edge {
                Edge::Branch(_) => stats.num_branches += 1,
                Edge::Hvdc(_) => stats.num_hvdc_lines += 1,
            }
        }
        stats
    }
}

/// Statistics about a network's size
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub num_buses: usize,
    pub num_gens: usize,
    pub num_voltage_controllers: usize,
    pub num_loads: usize,
    pub num_shunts: usize,
    pub num_branches: usize,
    pub num_hvdc_lines: usize,
    pub total_load_p: f64,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} buses, {} branches, {} HVDC lines, {} generators \
             ({} voltage controllers), {} loads, {} shunts",
            self.num_buses,
            self.num_branches,
            self.num_hvdc_lines,
            self.num_gens,
            self.num_voltage_controllers,
            self.num_loads,
            self.num_shunts
        )
    }
}
