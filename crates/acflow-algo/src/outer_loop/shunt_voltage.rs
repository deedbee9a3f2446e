//! Switched shunt voltage control, simple and incremental.

use std::collections::{BTreeMap, HashMap};

use acflow_core::{AcFlowResult, BusId, Direction, Network, ShuntId};
use tracing::debug;

use super::incremental::{step_towards_target, DirectionMemory, DiscreteStepper, StepCandidate};
use super::transformer_voltage::generator_controlled_buses;
use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::sensitivity::{ControlVariable, MonitoredQuantity, SensitivityRequest};

struct SectionStepper;

impl DiscreteStepper<ShuntId> for SectionStepper {
    fn step_delta(&self, network: &Network, key: ShuntId, direction: Direction) -> Option<f64> {
        network.shunt(key)?.sections.as_ref()?.step_delta(direction)
    }

    fn step(&self, network: &mut Network, key: ShuntId, direction: Direction) -> Option<f64> {
        network.shunt_mut(key)?.step_section(direction)
    }
}

/// Continuous susceptance during the first solves, then rounded to a section once.
#[derive(Debug, Clone, Default)]
pub struct SimpleShuntVoltageOuterLoop;

impl OuterLoop for SimpleShuntVoltageOuterLoop {
    type Data = ();

    fn name(&self) -> &'static str {
        "shunt_voltage_control"
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
        for shunt in env.network.shunts_mut() {
            if shunt.disabled || shunt.sections.is_none() {
                continue;
            }
            let Some(vc) = shunt.voltage_control.as_mut().filter(|vc| vc.enabled) else {
                continue;
            };
            vc.enabled = false;
            shunt.round_to_section();
            rounded += 1;
        }
        if rounded == 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        debug!(shunts = rounded, "susceptances rounded to nearest section");
        Ok(OuterLoopStatus::Unstable)
    }
}

#[derive(Debug, Clone)]
pub struct ShuntController {
    pub shunt: ShuntId,
    pub controlled_bus: BusId,
    pub target_v: f64,
    pub deadband: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalShuntVoltageData {
    pub controllers: Vec<ShuntController>,
    pub memories: HashMap<ShuntId, DirectionMemory>,
}

#[derive(Debug, Clone)]
pub struct IncrementalShuntVoltageOuterLoop {
    max_section_shift: usize,
}

impl IncrementalShuntVoltageOuterLoop {
    pub fn new(max_section_shift: usize) -> Self {
        Self { max_section_shift }
    }
}

impl OuterLoop for IncrementalShuntVoltageOuterLoop {
    type Data = IncrementalShuntVoltageData;

    fn name(&self) -> &'static str {
        "incremental_shunt_voltage_control"
    }

    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<IncrementalShuntVoltageData> {
        let mut data = IncrementalShuntVoltageData::default();
        for shunt in env.network.shunts_mut() {
            if shunt.disabled || shunt.sections.is_none() {
                continue;
            }
            let Some(vc) = shunt.voltage_control.as_mut().filter(|vc| vc.enabled) else {
                continue;
            };
            vc.enabled = false;
            data.controllers.push(ShuntController {
                shunt: shunt.id,
                controlled_bus: vc.controlled_bus,
                target_v: vc.target_v,
                deadband: vc.deadband,
            });
            shunt.round_to_section();
        }
        Ok(data)
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<IncrementalShuntVoltageData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let held = generator_controlled_buses(env.network);
        let mut by_bus: BTreeMap<BusId, Vec<&ShuntController>> = BTreeMap::new();
        let free = ctx.data.controllers.iter().filter(|c| !held.contains(&c.controlled_bus));
        for controller in free {
            by_bus.entry(controller.controlled_bus).or_default().push(controller);
        }

        let mut outside = Vec::new();
        for (bus, controllers) in &by_bus {
            let Some(v) = env.network.bus(*bus).map(|b| b.v) else {
                continue;
            };
            let half_deadband = controllers[0].deadband / 2.0;
            let diff = v - controllers[0].target_v;
            if diff.abs() > half_deadband {
                outside.push((*bus, diff, half_deadband));
            }
        }
        if outside.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let request = SensitivityRequest::new(
            outside
                .iter()
                .flat_map(|(bus, _, _)| {
                    by_bus[bus].iter().map(|c| ControlVariable::ShuntSusceptance(c.shunt))
                })
                .collect(),
            outside.iter().map(|(bus, _, _)| MonitoredQuantity::BusVoltage(*bus)).collect(),
        );
        let sensitivities = env.sensitivity.compute(env.network, &request)?;

        let mut steps = 0;
        for (bus, diff, half_deadband) in outside {
            let mut candidates: Vec<StepCandidate<ShuntId>> = by_bus[&bus]
                .iter()
                .map(|c| {
                    let s = sensitivities
                        .get(
                            ControlVariable::ShuntSusceptance(c.shunt),
                            MonitoredQuantity::BusVoltage(bus),
                        )
                        .unwrap_or(0.0);
                    StepCandidate::new(c.shunt, s)
                })
                .collect();
            let taken = step_towards_target(
                env.network,
                &SectionStepper,
                &mut candidates,
                &mut ctx.data.memories,
                diff,
                half_deadband,
                self.max_section_shift,
            );
            if taken > 0 {
                debug!(bus = %bus, diff, taken, "shunt sections moved");
            }
            steps += taken;
        }

        Ok(if steps > 0 {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }

    fn cleanup(
        &self,
        ctx: &mut OuterLoopContext<IncrementalShuntVoltageData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        for controller in &ctx.data.controllers {
            let shunt = env.network.shunt_mut(controller.shunt);
            if let Some(vc) = shunt.and_then(|s| s.voltage_control.as_mut()) {
                vc.enabled = true;
            }
        }
        Ok(())
    }

    fn modifies_model_on_initialize(&self) -> bool {
        true
    }
}
