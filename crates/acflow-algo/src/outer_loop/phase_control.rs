//! Phase shifter control.
//!
//! Active power controls are solved continuously by the first solves, then
//! fixed on the nearest tap at the first check. From the second check on,
//! current limiters above their limit move one tap per check in the
//! direction that lowers the current.

use acflow_core::{AcFlowResult, BranchId, BranchSide, Direction, PhaseControlMode};
use tracing::debug;

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::sensitivity::{ControlVariable, MonitoredQuantity, SensitivityRequest};

const SENSITIVITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default)]
pub struct PhaseControlData {
    pub first_check_done: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseControlOuterLoop;

impl PhaseControlOuterLoop {
    fn fix_active_power_controls(&self, env: &mut LoopEnv<'_>) -> usize {
        let mut count = 0;
        for branch in env.network.branches_mut() {
            if branch.disabled || branch.phase_tap_changer.is_none() {
                continue;
            }
            let Some(pc) = branch.phase_control.as_mut() else {
                continue;
            };
            if !pc.enabled || !matches!(pc.mode, PhaseControlMode::ActivePowerControl { .. }) {
                continue;
            }
            pc.enabled = false;
            branch.round_phase_to_tap();
            debug!(branch = %branch.id, alpha = branch.alpha, "phase shifter fixed on tap");
            count += 1;
        }
        count
    }

    fn limit_currents(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<usize> {
        let overloaded: Vec<(BranchId, BranchSide, f64)> = env
            .network
            .branches()
            .filter(|b| !b.disabled && b.phase_tap_changer.is_some())
            .filter_map(|b| {
                let pc = b.phase_control.as_ref().filter(|pc| pc.enabled)?;
                let PhaseControlMode::CurrentLimiter { limit } = pc.mode else {
                    return None;
                };
                let i = b.flows.i(pc.side);
                (i > limit).then_some((b.id, pc.side, i - limit))
            })
            .collect();
        if overloaded.is_empty() {
            return Ok(0);
        }

        let request = SensitivityRequest::new(
            overloaded.iter().map(|(id, _, _)| ControlVariable::PhaseShift(*id)).collect(),
            overloaded
                .iter()
                .map(|(id, side, _)| MonitoredQuantity::BranchCurrent(*id, *side))
                .collect(),
        );
        let sensitivities = env.sensitivity.compute(env.network, &request)?;

        let mut moved = 0;
        for (id, side, excess) in overloaded {
            let s = sensitivities
                .get(ControlVariable::PhaseShift(id), MonitoredQuantity::BranchCurrent(id, side))
                .unwrap_or(0.0);
            if s.abs() < SENSITIVITY_EPSILON {
                continue;
            }
            let direction = Direction::of(-s);
            if let Some(delta) = env.network.branch_mut(id).and_then(|b| b.step_phase(direction)) {
                debug!(branch = %id, excess, delta, "current limiter tap moved");
                moved += 1;
            }
        }
        Ok(moved)
    }
}

impl OuterLoop for PhaseControlOuterLoop {
    type Data = PhaseControlData;

    fn name(&self) -> &'static str {
        "phase_control"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<PhaseControlData> {
        Ok(PhaseControlData::default())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<PhaseControlData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let moved = if ctx.data.first_check_done {
            self.limit_currents(env)?
        } else {
            ctx.data.first_check_done = true;
            self.fix_active_power_controls(env)
        };
        Ok(if moved > 0 {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::AcLoadFlowParameters;
    use crate::solver::SolveResult;
    use crate::testing::FixedSensitivity;
    use acflow_core::*;

    fn network(mode: PhaseControlMode) -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "B1", 400.0)).unwrap();
        network.add_bus(Bus::new(BusId::new(2), "B2", 400.0)).unwrap();
        network
            .add_branch(
                Branch::new(BranchId::new(1), "PST", BusId::new(1), BusId::new(2), 0.0, 0.05)
                    .with_phase_tap_changer(TapChanger::uniform(-0.2, 0.2, 41, 20))
                    .with_phase_control(mode, BranchSide::One),
            )
            .unwrap();
        network
    }

    fn context() -> OuterLoopContext<PhaseControlData> {
        OuterLoopContext {
            iteration: 0,
            total_iterations: 0,
            last_solve: SolveResult::default(),
            data: PhaseControlData::default(),
        }
    }

    #[test]
    fn test_active_power_control_fixed_at_first_check() {
        let mut network = network(PhaseControlMode::ActivePowerControl { target_p: 0.3 });
        network.branch_mut(BranchId::new(1)).unwrap().alpha = 0.0513;
        let parameters = AcLoadFlowParameters::default();
        let sensitivity = FixedSensitivity::zero();
        let mut env = LoopEnv {
            network: &mut network,
            sensitivity: &sensitivity,
            parameters: &parameters,
        };
        let mut ctx = context();
        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Unstable
        );
        let branch = env.network.branch(BranchId::new(1)).unwrap();
        assert!((branch.alpha - 0.05).abs() < 1e-9);
        assert!(!branch.phase_control.as_ref().unwrap().enabled);
        assert!(ctx.data.first_check_done);

        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Stable
        );
    }

    #[test]
    fn test_current_limiter_moves_one_tap_against_current() {
        let mut network = network(PhaseControlMode::CurrentLimiter { limit: 1.0 });
        network.branch_mut(BranchId::new(1)).unwrap().flows.i1 = 1.2;
        let parameters = AcLoadFlowParameters::default();
        let sensitivity = FixedSensitivity::zero().with(
            ControlVariable::PhaseShift(BranchId::new(1)),
            MonitoredQuantity::BranchCurrent(BranchId::new(1), BranchSide::One),
            5.0,
        );
        let mut env = LoopEnv {
            network: &mut network,
            sensitivity: &sensitivity,
            parameters: &parameters,
        };
        let mut ctx = context();
        ctx.data.first_check_done = true;
        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Unstable
        );
        let tap = env.network.branch(BranchId::new(1)).unwrap().phase_tap_changer.clone().unwrap();
        assert_eq!(tap.position, 19);

        env.network.branch_mut(BranchId::new(1)).unwrap().flows.i1 = 0.95;
        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Stable
        );
    }

    #[test]
    fn test_first_check_leaves_current_limiters_alone() {
        let mut network = network(PhaseControlMode::CurrentLimiter { limit: 1.0 });
        network.branch_mut(BranchId::new(1)).unwrap().flows.i1 = 1.2;
        let parameters = AcLoadFlowParameters::default();
        let sensitivity = FixedSensitivity::zero().with(
            ControlVariable::PhaseShift(BranchId::new(1)),
            MonitoredQuantity::BranchCurrent(BranchId::new(1), BranchSide::One),
            5.0,
        );
        let mut env = LoopEnv {
            network: &mut network,
            sensitivity: &sensitivity,
            parameters: &parameters,
        };
        let mut ctx = context();
        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Stable
        );
        let tap = env.network.branch(BranchId::new(1)).unwrap().phase_tap_changer.clone().unwrap();
        assert_eq!(tap.position, 20);

        assert_eq!(
            PhaseControlOuterLoop.check(&mut ctx, &mut env).unwrap(),
            OuterLoopStatus::Unstable
        );
        let tap = env.network.branch(BranchId::new(1)).unwrap().phase_tap_changer.clone().unwrap();
        assert_eq!(tap.position, 19);
    }
}
