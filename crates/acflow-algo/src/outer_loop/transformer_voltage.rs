//! Transformer voltage control.
//!
//! - [`SimpleTransformerVoltageOuterLoop`] lets the solver treat the ratio as
//!   a continuous unknown, then disables the control and snaps the ratio to
//!   the nearest tap once.
//! - [`IncrementalTransformerVoltageOuterLoop`] keeps ratios on taps for the
//!   whole session and moves them step by step from `dV/drho` sensitivities.

use std::collections::{BTreeMap, HashMap};

use acflow_core::{AcFlowResult, BranchId, BusId, Direction, Network};
use tracing::debug;

use super::incremental::{step_towards_target, DirectionMemory, DiscreteStepper, StepCandidate};
use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::sensitivity::{ControlVariable, MonitoredQuantity, SensitivityRequest};

/// Ratio tap changers stepped in place.
pub(crate) struct RatioTapStepper;

impl DiscreteStepper<BranchId> for RatioTapStepper {
    fn step_delta(&self, network: &Network, key: BranchId, direction: Direction) -> Option<f64> {
        network.branch(key)?.ratio_tap_changer.as_ref()?.step_delta(direction)
    }

    fn step(&self, network: &mut Network, key: BranchId, direction: Direction) -> Option<f64> {
        network.branch_mut(key)?.step_ratio(direction)
    }
}

/// Buses whose voltage is held by an enabled generator.
pub(crate) fn generator_controlled_buses(network: &Network) -> Vec<BusId> {
    network
        .generators()
        .filter(|g| g.is_voltage_controlling())
        .filter_map(|g| g.voltage_control.as_ref().map(|vc| vc.controlled_bus))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SimpleTransformerVoltageOuterLoop;

impl OuterLoop for SimpleTransformerVoltageOuterLoop {
    type Data = ();

    fn name(&self) -> &'static str {
        "transformer_voltage_control"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<()> {
        Ok(())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<()>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        if ctx.iteration > 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        let mut rounded = 0;
        for branch in env.network.branches_mut() {
            let enabled = branch.voltage_control.as_ref().is_some_and(|vc| vc.enabled);
            if !enabled || branch.disabled || branch.ratio_tap_changer.is_none() {
                continue;
            }
            if let Some(vc) = branch.voltage_control.as_mut() {
                vc.enabled = false;
            }
            branch.round_ratio_to_tap();
            rounded += 1;
        }
        if rounded == 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        debug!(transformers = rounded, "ratios rounded to nearest tap");
        Ok(OuterLoopStatus::Unstable)
    }
}

#[derive(Debug, Clone)]
pub struct TransformerVoltageController {
    pub branch: BranchId,
    pub controlled_bus: BusId,
    pub target_v: f64,
    pub deadband: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalTransformerVoltageData {
    pub controllers: Vec<TransformerVoltageController>,
    pub memories: HashMap<BranchId, DirectionMemory>,
}

#[derive(Debug, Clone)]
pub struct IncrementalTransformerVoltageOuterLoop {
    max_tap_shift: usize,
}

impl IncrementalTransformerVoltageOuterLoop {
    pub fn new(max_tap_shift: usize) -> Self {
        Self { max_tap_shift }
    }
}

impl OuterLoop for IncrementalTransformerVoltageOuterLoop {
    type Data = IncrementalTransformerVoltageData;

    fn name(&self) -> &'static str {
        "incremental_transformer_voltage_control"
    }

    /// Take the controls out of the equations and put ratios on taps.
    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<IncrementalTransformerVoltageData> {
        let mut data = IncrementalTransformerVoltageData::default();
        for branch in env.network.branches_mut() {
            if branch.disabled || branch.ratio_tap_changer.is_none() {
                continue;
            }
            let Some(vc) = branch.voltage_control.as_mut().filter(|vc| vc.enabled) else {
                continue;
            };
            vc.enabled = false;
            data.controllers.push(TransformerVoltageController {
                branch: branch.id,
                controlled_bus: vc.controlled_bus,
                target_v: vc.target_v,
                deadband: vc.deadband,
            });
            branch.round_ratio_to_tap();
        }
        Ok(data)
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<IncrementalTransformerVoltageData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let held = generator_controlled_buses(env.network);
        let mut by_bus: BTreeMap<BusId, Vec<&TransformerVoltageController>> = BTreeMap::new();
        for controller in &ctx.data.controllers {
            if !held.contains(&controller.controlled_bus) {
                by_bus.entry(controller.controlled_bus).or_default().push(controller);
            }
        }

        let mut outside = Vec::new();
        for (bus, controllers) in &by_bus {
            let Some(v) = env.network.bus(*bus).map(|b| b.v) else {
                continue;
            };
            let first = controllers[0];
            let diff = v - first.target_v;
            if diff.abs() > first.deadband / 2.0 {
                outside.push((*bus, diff, first.deadband / 2.0));
            }
        }
        if outside.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let request = SensitivityRequest::new(
            outside
                .iter()
                .flat_map(|(bus, _, _)| {
                    by_bus[bus].iter().map(|c| ControlVariable::TapRatio(c.branch))
                })
                .collect(),
            outside.iter().map(|(bus, _, _)| MonitoredQuantity::BusVoltage(*bus)).collect(),
        );
        let sensitivities = env.sensitivity.compute(env.network, &request)?;

        let mut steps = 0;
        for (bus, diff, half_deadband) in outside {
            let mut candidates: Vec<StepCandidate<BranchId>> = by_bus[&bus]
                .iter()
                .map(|c| {
                    let s = sensitivities
                        .get(
                            ControlVariable::TapRatio(c.branch),
                            MonitoredQuantity::BusVoltage(bus),
                        )
                        .unwrap_or(0.0);
                    StepCandidate::new(c.branch, s)
                })
                .collect();
            let taken = step_towards_target(
                env.network,
                &RatioTapStepper,
                &mut candidates,
                &mut ctx.data.memories,
                diff,
                half_deadband,
                self.max_tap_shift,
            );
            if taken > 0 {
                debug!(bus = %bus, diff, taken, "transformer taps moved");
            }
            steps += taken;
        }

        Ok(if steps > 0 {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }

    /// Hand the controls back to the network, taps stay where they are.
    fn cleanup(
        &self,
        ctx: &mut OuterLoopContext<IncrementalTransformerVoltageData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        for controller in &ctx.data.controllers {
            if let Some(vc) = env
                .network
                .branch_mut(controller.branch)
                .and_then(|b| b.voltage_control.as_mut())
            {
                vc.enabled = true;
            }
        }
        Ok(())
    }

    fn modifies_model_on_initialize(&self) -> bool {
        true
    }
}
