//! Distributed slack: spread the slack bus mismatch over participating units.

use acflow_core::{AcFlowError, AcFlowResult, Network, BASE_MVA};
use tracing::{debug, warn};

use super::distribution::{ActivePowerDistribution, DistributionResult, TargetSnapshot};
use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::parameters::{SlackDistributionFailureBehavior, SlackParameters};

/// Residual below which a distribution counts as complete (p.u.).
pub(crate) const RESIDUAL_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct DistributedSlackOuterLoop {
    distribution: ActivePowerDistribution,
    threshold: f64,
    failure_behavior: SlackDistributionFailureBehavior,
}

#[derive(Debug, Clone, Default)]
pub struct DistributedSlackData {
    /// Active power moved onto participants during the session (p.u.)
    pub distributed: f64,
}

impl DistributedSlackOuterLoop {
    pub fn new(parameters: &SlackParameters) -> Self {
        Self {
            distribution: ActivePowerDistribution::new(parameters.balance_type),
            threshold: parameters.max_mismatch_pu(),
            failure_behavior: parameters.failure_behavior,
        }
    }
}

/// Turn a distribution outcome into a loop status according to the failure policy.
///
/// `total` accumulates the distributed power; with [`SlackDistributionFailureBehavior::Fail`]
/// both the participant targets and `total` are put back to their previous values.
pub(crate) fn settle_distribution(
    policy: SlackDistributionFailureBehavior,
    result: DistributionResult,
    snapshot: &TargetSnapshot,
    network: &mut Network,
    total: &mut f64,
) -> AcFlowResult<OuterLoopStatus> {
    let previous_total = *total;
    *total += result.distributed;
    let changed = if result.moved {
        OuterLoopStatus::Unstable
    } else {
        OuterLoopStatus::Stable
    };
    if result.remaining.abs() < RESIDUAL_EPSILON {
        return Ok(changed);
    }

    let remaining_mw = result.remaining * BASE_MVA;
    match policy {
        SlackDistributionFailureBehavior::Throw => {
            Err(AcFlowError::ActivePowerDistribution { remaining_mw })
        }
        SlackDistributionFailureBehavior::LeaveOnSlackBus => {
            warn!(remaining_mw, "active power left on slack bus");
            Ok(changed)
        }
        SlackDistributionFailureBehavior::Fail => {
            warn!(remaining_mw, "active power distribution failed, rolling back");
            snapshot.restore(network);
            *total = previous_total;
            Ok(OuterLoopStatus::Failed)
        }
    }
}

impl OuterLoop for DistributedSlackOuterLoop {
    type Data = DistributedSlackData;

    fn name(&self) -> &'static str {
        "distributed_slack"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<DistributedSlackData> {
        Ok(DistributedSlackData::default())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<DistributedSlackData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let mismatch = ctx.last_solve.slack_bus_active_power_mismatch;
        if mismatch.abs() <= self.threshold {
            return Ok(OuterLoopStatus::Stable);
        }

        let participants = self.distribution.participants(env.network, |_| true);
        let snapshot = TargetSnapshot::take(env.network, &participants);
        let result = self.distribution.run(env.network, &participants, mismatch);
        debug!(
            mismatch_mw = mismatch * BASE_MVA,
            distributed_mw = result.distributed * BASE_MVA,
            participants = participants.len(),
            "slack distribution"
        );
        settle_distribution(
            self.failure_behavior,
            result,
            &snapshot,
            env.network,
            &mut ctx.data.distributed,
        )
    }

    fn distributed_active_power(&self, data: &DistributedSlackData) -> f64 {
        data.distributed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outer_loop::distribution::Participant;
    use crate::parameters::BalanceType;
    use acflow_core::*;

    fn network() -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "B1", 400.0)).unwrap();
        network
            .add_generator(
                Gen::new(GenId::new(1), "G1", BusId::new(1))
                    .with_target_p(0.5)
                    .with_p_limits(0.0, 1.0),
            )
            .unwrap();
        network
    }

    #[test]
    fn test_fail_policy_rolls_back_exactly() {
        let mut network = network();
        let distribution = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax);
        let participants = vec![Participant::Generator(GenId::new(1))];
        let snapshot = TargetSnapshot::take(&network, &participants);
        let result = distribution.run(&mut network, &participants, 0.8);
        assert!(result.remaining > 0.0);

        let mut total = 0.125;
        let status = settle_distribution(
            SlackDistributionFailureBehavior::Fail,
            result,
            &snapshot,
            &mut network,
            &mut total,
        )
        .unwrap();
        assert_eq!(status, OuterLoopStatus::Failed);
        assert_eq!(total, 0.125);
        assert_eq!(network.generator(GenId::new(1)).unwrap().target_p, 0.5);
    }

    #[test]
    fn test_leave_on_slack_keeps_partial_move() {
        let mut network = network();
        let distribution = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax);
        let participants = vec![Participant::Generator(GenId::new(1))];
        let snapshot = TargetSnapshot::take(&network, &participants);
        let result = distribution.run(&mut network, &participants, 0.8);
        let mut total = 0.0;
        let status = settle_distribution(
            SlackDistributionFailureBehavior::LeaveOnSlackBus,
            result,
            &snapshot,
            &mut network,
            &mut total,
        )
        .unwrap();
        assert_eq!(status, OuterLoopStatus::Unstable);
        assert!((total - 0.5).abs() < 1e-12);
        assert_eq!(network.generator(GenId::new(1)).unwrap().target_p, 1.0);
    }

    #[test]
    fn test_throw_policy_is_an_error() {
        let mut network = network();
        let distribution = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax);
        let participants = vec![Participant::Generator(GenId::new(1))];
        let snapshot = TargetSnapshot::take(&network, &participants);
        let result = distribution.run(&mut network, &participants, 0.8);
        let mut total = 0.0;
        let err = settle_distribution(
            SlackDistributionFailureBehavior::Throw,
            result,
            &snapshot,
            &mut network,
            &mut total,
        )
        .unwrap_err();
        match err {
            AcFlowError::ActivePowerDistribution { remaining_mw } => {
                assert!((remaining_mw - 30.0).abs() < 1e-6)
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
