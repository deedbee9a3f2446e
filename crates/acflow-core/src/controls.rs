//! Controllable device data: voltage controls, tap changers, HVDC AC emulation.
//!
//! Every control carries an `enabled` flag. Outer loops flip these flags and
//! move the discrete positions; the nonlinear solver only ever sees the
//! current flags and set-points.

use serde::{Deserialize, Serialize};

use crate::{BranchId, BusId};

/// Side of a branch (or of an HVDC link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchSide {
    One,
    Two,
}

/// Direction of a discrete control move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Increase => Direction::Decrease,
            Direction::Decrease => Direction::Increase,
        }
    }

    /// Direction that moves a quantity by `delta` (positive means increase).
    pub fn of(delta: f64) -> Self {
        if delta >= 0.0 {
            Direction::Increase
        } else {
            Direction::Decrease
        }
    }
}

/// Discrete positions of a tap changer (ratio or phase angle) or of a shunt.
///
/// `steps` is sorted in increasing value order and `position` indexes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapChanger {
    pub steps: Vec<f64>,
    pub position: usize,
}

impl TapChanger {
    pub fn new(steps: Vec<f64>, position: usize) -> Self {
        Self { steps, position }
    }

    /// Uniform tap changer from `min` to `max` with `count` positions.
    pub fn uniform(min: f64, max: f64, count: usize, position: usize) -> Self {
        let steps = if count < 2 {
            vec![min]
        } else {
            (0..count)
                .map(|k| min + (max - min) * k as f64 / (count - 1) as f64)
                .collect()
        };
        Self { steps, position }
    }

    pub fn value(&self) -> f64 {
        self.steps.get(self.position).copied().unwrap_or(0.0)
    }

    pub fn min_value(&self) -> f64 {
        self.steps.first().copied().unwrap_or(0.0)
    }

    pub fn max_value(&self) -> f64 {
        self.steps.last().copied().unwrap_or(0.0)
    }

    /// Position whose value is closest to `value`.
    pub fn nearest_position(&self, value: f64) -> usize {
        self.steps
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - value)
                    .abs()
                    .partial_cmp(&(*b - value).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(k, _)| k)
            .unwrap_or(0)
    }

    /// Value change a single step in `direction` would produce, if possible.
    pub fn step_delta(&self, direction: Direction) -> Option<f64> {
        let next = match direction {
            Direction::Increase => self.position.checked_add(1)?,
            Direction::Decrease => self.position.checked_sub(1)?,
        };
        let target = self.steps.get(next)?;
        Some(target - self.value())
    }

    /// Move one step; returns the value change.
    pub fn step(&mut self, direction: Direction) -> Option<f64> {
        let delta = self.step_delta(direction)?;
        match direction {
            Direction::Increase => self.position += 1,
            Direction::Decrease => self.position -= 1,
        }
        Some(delta)
    }
}

/// Generator (primary) voltage control, possibly remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorVoltageControl {
    pub controlled_bus: BusId,
    /// Voltage target (p.u.)
    pub target_v: f64,
    pub enabled: bool,
}

/// Transformer ratio control of a bus voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerVoltageControl {
    pub controlled_bus: BusId,
    pub target_v: f64,
    /// Full dead-band width (p.u.); the target is met within ±deadband/2
    pub deadband: f64,
    pub enabled: bool,
}

/// Transformer ratio control of a branch reactive power flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerReactivePowerControl {
    pub controlled_branch: BranchId,
    pub side: BranchSide,
    /// Reactive power target (p.u.)
    pub target_q: f64,
    pub deadband: f64,
    pub enabled: bool,
}

/// Switched shunt control of a bus voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuntVoltageControl {
    pub controlled_bus: BusId,
    pub target_v: f64,
    pub deadband: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhaseControlMode {
    /// Continuous regulation of the branch active power flow (p.u.)
    ActivePowerControl { target_p: f64 },
    /// Discrete limitation of the branch current (p.u.)
    CurrentLimiter { limit: f64 },
}

/// Phase shifter control on its own branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseControl {
    pub mode: PhaseControlMode,
    pub side: BranchSide,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcEmulationStatus {
    Linear,
    SaturatedSide1,
    SaturatedSide2,
    Frozen,
}

/// HVDC AC emulation: `P = p0 + droop * (θ1 - θ2)` sent from side 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcEmulation {
    /// Active power offset (p.u.)
    pub p0: f64,
    /// Droop (p.u./rad)
    pub droop: f64,
    pub status: AcEmulationStatus,
    /// Sent power while frozen or saturated (p.u.)
    pub fixed_p: f64,
}

impl AcEmulation {
    pub fn new(p0: f64, droop: f64) -> Self {
        Self {
            p0,
            droop,
            status: AcEmulationStatus::Linear,
            fixed_p: 0.0,
        }
    }

    /// Unsaturated emulated flow for the given terminal angles.
    pub fn linear_flow(&self, angle1: f64, angle2: f64) -> f64 {
        self.p0 + self.droop * (angle1 - angle2)
    }
}
