//! Shared machinery of the incremental (sensitivity driven) controls.
//!
//! Each discrete controller remembers the direction it is allowed to move
//! in. The memory may change at most [`MAX_DIRECTION_CHANGE`] times per
//! session, after which moves against the remembered direction are refused.
//! This bounds tap oscillations between two positions.

use std::collections::HashMap;
use std::hash::Hash;

use acflow_core::{Direction, Network};
use tracing::trace;

pub const MAX_DIRECTION_CHANGE: usize = 2;

const SENSITIVITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedDirection {
    Both,
    Increase,
    Decrease,
}

impl AllowedDirection {
    fn matches(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (AllowedDirection::Both, _)
                | (AllowedDirection::Increase, Direction::Increase)
                | (AllowedDirection::Decrease, Direction::Decrease)
        )
    }
}

impl From<Direction> for AllowedDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Increase => AllowedDirection::Increase,
            Direction::Decrease => AllowedDirection::Decrease,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionMemory {
    pub allowed: AllowedDirection,
    pub changes: usize,
}

impl Default for DirectionMemory {
    fn default() -> Self {
        Self {
            allowed: AllowedDirection::Both,
            changes: 0,
        }
    }
}

impl DirectionMemory {
    pub fn permits(&self, direction: Direction) -> bool {
        self.allowed.matches(direction) || self.changes < MAX_DIRECTION_CHANGE
    }

    pub fn record(&mut self, direction: Direction) {
        let wanted = AllowedDirection::from(direction);
        if self.allowed != wanted && self.changes < MAX_DIRECTION_CHANGE {
            self.allowed = wanted;
            self.changes += 1;
        }
    }
}

/// One controller acting on a shared controlled quantity.
#[derive(Debug, Clone, Copy)]
pub struct StepCandidate<K> {
    pub key: K,
    /// d(controlled quantity) / d(control value)
    pub sensitivity: f64,
    /// Steps taken in the current pass
    pub shifts: usize,
}

impl<K> StepCandidate<K> {
    pub fn new(key: K, sensitivity: f64) -> Self {
        Self {
            key,
            sensitivity,
            shifts: 0,
        }
    }
}

/// Discrete control that can report and take single steps.
pub trait DiscreteStepper<K> {
    /// Control value change one step in `direction` would produce
    fn step_delta(&self, network: &Network, key: K, direction: Direction) -> Option<f64>;
    /// Take the step; returns the control value change
    fn step(&self, network: &mut Network, key: K, direction: Direction) -> Option<f64>;
}

/// Move controllers sharing one controlled quantity towards its target.
///
/// `diff` is `measured - target`. Steps are granted one at a time, round
/// robin over the candidates, while a step reduces the predicted deviation
/// and the deviation is outside the half dead-band. Returns the number of
/// steps taken.
pub fn step_towards_target<K, S>(
    network: &mut Network,
    stepper: &S,
    candidates: &mut [StepCandidate<K>],
    memories: &mut HashMap<K, DirectionMemory>,
    mut diff: f64,
    half_deadband: f64,
    max_tap_shift: usize,
) -> usize
where
    K: Copy + Eq + Hash + std::fmt::Debug,
    S: DiscreteStepper<K>,
{
    let mut steps = 0;
    loop {
        let mut progressed = false;
        for candidate in candidates.iter_mut() {
            if diff.abs() <= half_deadband {
                return steps;
            }
            if candidate.sensitivity.abs() < SENSITIVITY_EPSILON
                || candidate.shifts >= max_tap_shift
            {
                continue;
            }
            let direction = Direction::of(-diff * candidate.sensitivity);
            let memory = memories.entry(candidate.key).or_default();
            if !memory.permits(direction) {
                trace!(controller = ?candidate.key, ?direction, "direction change refused");
                continue;
            }
            let Some(delta) = stepper.step_delta(network, candidate.key, direction) else {
                continue;
            };
            let predicted = diff + candidate.sensitivity * delta;
            if predicted.abs() >= diff.abs() {
                continue;
            }
            if stepper.step(network, candidate.key, direction).is_none() {
                continue;
            }
            memory.record(direction);
            candidate.shifts += 1;
            diff = predicted;
            steps += 1;
            progressed = true;
        }
        if !progressed {
            return steps;
        }
    }
}
