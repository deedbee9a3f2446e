//! Control areas, pilot-point zones and overload-management automata.

use serde::{Deserialize, Serialize};

use crate::{AreaId, BranchId, BranchSide, BusId};

/// Branch side through which an area exports power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaBoundary {
    pub branch: BranchId,
    /// Side located inside the area
    pub side: BranchSide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    /// Scheduled net export (p.u.), positive when leaving the area
    pub interchange_target: f64,
    pub boundaries: Vec<AreaBoundary>,
}

impl Area {
    pub fn new(id: AreaId, name: impl Into<String>, interchange_target: f64) -> Self {
        Self {
            id,
            name: name.into(),
            interchange_target,
            boundaries: Vec::new(),
        }
    }

    pub fn with_boundary(mut self, branch: BranchId, side: BranchSide) -> Self {
        self.boundaries.push(AreaBoundary { branch, side });
        self
    }

    pub fn is_boundary(&self, branch: BranchId) -> bool {
        self.boundaries.iter().any(|b| b.branch == branch)
    }
}

/// Secondary voltage control zone: a pilot bus whose voltage is held by
/// moving the primary targets of every generator regulating `controlled_buses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageControlZone {
    pub name: String,
    pub pilot_bus: BusId,
    /// Pilot voltage target (p.u.)
    pub target_v: f64,
    pub controlled_buses: Vec<BusId>,
    pub enabled: bool,
}

/// Automaton that operates a switch when a monitored current exceeds a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverloadManagementSystem {
    pub name: String,
    pub monitored_branch: BranchId,
    pub monitored_side: BranchSide,
    /// Current threshold (p.u.)
    pub threshold: f64,
    pub switch_branch: BranchId,
    /// True to open the switch when tripping, false to close it
    pub open: bool,
    pub enabled: bool,
}
