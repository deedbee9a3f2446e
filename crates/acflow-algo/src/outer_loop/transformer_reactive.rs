//! Transformer reactive power control.
//!
//! Ratio tap changers regulating the reactive power flowing through a branch
//! side. Like the voltage variant, the simple loop rounds continuous ratios
//! once and the incremental loop steps taps from `dQ/drho` sensitivities.

use std::collections::{BTreeMap, HashMap};

use acflow_core::{AcFlowResult, BranchId, BranchSide};
use tracing::debug;

use super::incremental::{step_towards_target, DirectionMemory, StepCandidate};
use super::transformer_voltage::RatioTapStepper;
use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::sensitivity::{ControlVariable, MonitoredQuantity, SensitivityRequest};

#[derive(Debug, Clone, Default)]
pub struct SimpleTransformerReactivePowerOuterLoop;

impl OuterLoop for SimpleTransformerReactivePowerOuterLoop {
    type Data = ();

    fn name(&self) -> &'static str {
        "transformer_reactive_power_control"
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
            if branch.disabled || branch.ratio_tap_changer.is_none() {
                continue;
            }
            let Some(rc) = branch.reactive_power_control.as_mut().filter(|rc| rc.enabled) else {
                continue;
            };
            rc.enabled = false;
            branch.round_ratio_to_tap();
            rounded += 1;
        }
        if rounded == 0 {
            Ok(OuterLoopStatus::Stable)
        } else {
            debug!(transformers = rounded, "reactive power controlled ratios rounded");
            Ok(OuterLoopStatus::Unstable)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReactivePowerController {
    pub branch: BranchId,
    pub controlled_branch: BranchId,
    pub side: BranchSide,
    pub target_q: f64,
    pub deadband: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalTransformerReactivePowerData {
    pub controllers: Vec<ReactivePowerController>,
    pub memories: HashMap<BranchId, DirectionMemory>,
}

#[derive(Debug, Clone)]
pub struct IncrementalTransformerReactivePowerOuterLoop {
    max_tap_shift: usize,
}

impl IncrementalTransformerReactivePowerOuterLoop {
    pub fn new(max_tap_shift: usize) -> Self {
        Self { max_tap_shift }
    }
}

impl OuterLoop for IncrementalTransformerReactivePowerOuterLoop {
    type Data = IncrementalTransformerReactivePowerData;

    fn name(&self) -> &'static str {
        "incremental_transformer_reactive_power_control"
    }

    fn initialize(
        &self,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<IncrementalTransformerReactivePowerData> {
        let mut data = IncrementalTransformerReactivePowerData::default();
        for branch in env.network.branches_mut() {
            if branch.disabled || branch.ratio_tap_changer.is_none() {
                continue;
            }
            let Some(rc) = branch.reactive_power_control.as_mut().filter(|rc| rc.enabled) else {
                continue;
            };
            rc.enabled = false;
            data.controllers.push(ReactivePowerController {
                branch: branch.id,
                controlled_branch: rc.controlled_branch,
                side: rc.side,
                target_q: rc.target_q,
                deadband: rc.deadband,
            });
            branch.round_ratio_to_tap();
        }
        Ok(data)
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<IncrementalTransformerReactivePowerData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        // Several transformers may regulate the same branch side
        let mut by_flow: BTreeMap<(BranchId, u8), Vec<&ReactivePowerController>> = BTreeMap::new();
        for controller in &ctx.data.controllers {
            let side = match controller.side {
                BranchSide::One => 1,
                BranchSide::Two => 2,
            };
            by_flow.entry((controller.controlled_branch, side)).or_default().push(controller);
        }

        let mut outside = Vec::new();
        for controllers in by_flow.values() {
            let first = controllers[0];
            let Some(branch) = env
                .network
                .branch(first.controlled_branch)
                .filter(|b| !b.disabled)
            else {
                continue;
            };
            let diff = branch.flows.q(first.side) - first.target_q;
            if diff.abs() > first.deadband / 2.0 {
                outside.push((controllers.clone(), diff, first.deadband / 2.0));
            }
        }
        if outside.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let monitored_of = |c: &ReactivePowerController| {
            MonitoredQuantity::BranchReactivePower(c.controlled_branch, c.side)
        };
        let request = SensitivityRequest::new(
            outside
                .iter()
                .flat_map(|(controllers, _, _)| {
                    controllers.iter().map(|c| ControlVariable::TapRatio(c.branch))
                })
                .collect(),
            outside.iter().map(|(controllers, _, _)| monitored_of(controllers[0])).collect(),
        );
        let sensitivities = env.sensitivity.compute(env.network, &request)?;

        let mut steps = 0;
        for (controllers, diff, half_deadband) in outside {
            let monitored = monitored_of(controllers[0]);
            let mut candidates: Vec<StepCandidate<BranchId>> = controllers
                .iter()
                .map(|c| {
                    let s = sensitivities
                        .get(ControlVariable::TapRatio(c.branch), monitored)
                        .unwrap_or(0.0);
                    StepCandidate::new(c.branch, s)
                })
                .collect();
            steps += step_towards_target(
                env.network,
                &RatioTapStepper,
                &mut candidates,
                &mut ctx.data.memories,
                diff,
                half_deadband,
                self.max_tap_shift,
            );
        }

        if steps > 0 {
            debug!(steps, "reactive power controlled taps moved");
            Ok(OuterLoopStatus::Unstable)
        } else {
            Ok(OuterLoopStatus::Stable)
        }
    }

    fn cleanup(
        &self,
        ctx: &mut OuterLoopContext<IncrementalTransformerReactivePowerData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        for controller in &ctx.data.controllers {
            if let Some(rc) = env
                .network
                .branch_mut(controller.branch)
                .and_then(|b| b.reactive_power_control.as_mut())
            {
                rc.enabled = true;
            }
        }
        Ok(())
    }

    fn modifies_model_on_initialize(&self) -> bool {
        true
    }
}
