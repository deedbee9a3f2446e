//! Area interchange control.
//!
//! Each area has a scheduled net export. The power an area must add is
//! `target - interchange + share * slack_mismatch`, where `share` is the
//! area's part of the slack bus mismatch. Areas outside their tolerance get
//! that power distributed over their own participants.
//!
//! The slack share map is computed once per session from the topology. Each
//! slack bus carries an equal part of the mismatch. That part goes to the
//! bus's own area, or is split evenly between the areas reached first without
//! crossing a boundary branch when the bus sits outside every area.

use std::collections::BTreeMap;

use acflow_core::{topology, AcFlowResult, Area, AreaId, Network, BASE_MVA};
use tracing::{debug, warn};

use super::distributed_slack::{settle_distribution, RESIDUAL_EPSILON};
use super::distribution::{ActivePowerDistribution, DistributionResult, Participant, TargetSnapshot};
use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::parameters::{
    AreaInterchangeParameters, SlackDistributionFailureBehavior, SlackParameters,
};
use crate::solver::model::choose_reference;

#[derive(Debug, Clone, Default)]
pub struct AreaInterchangeData {
    /// Fraction of the slack bus mismatch carried by each area
    pub slack_shares: BTreeMap<AreaId, f64>,
    /// Active power distributed in each area during the session (p.u.)
    pub distributed_by_area: BTreeMap<AreaId, f64>,
    pub distributed: f64,
}

#[derive(Debug, Clone)]
pub struct AreaInterchangeOuterLoop {
    distribution: ActivePowerDistribution,
    failure_behavior: SlackDistributionFailureBehavior,
    max_mismatch: f64,
    relative_mismatch: f64,
}

impl AreaInterchangeOuterLoop {
    pub fn new(slack: &SlackParameters, parameters: &AreaInterchangeParameters) -> Self {
        Self {
            distribution: ActivePowerDistribution::new(slack.balance_type),
            failure_behavior: slack.failure_behavior,
            max_mismatch: parameters.max_mismatch_mw / BASE_MVA,
            relative_mismatch: parameters.relative_mismatch,
        }
    }

    fn tolerance(&self, area: &Area) -> f64 {
        self.max_mismatch + self.relative_mismatch * area.interchange_target.abs()
    }
}

/// Net power leaving the area through its boundary branches (p.u.).
pub fn interchange(network: &Network, area: &Area) -> f64 {
    area.boundaries
        .iter()
        .filter_map(|b| {
            let branch = network.branch(b.branch).filter(|br| !br.disabled)?;
            Some(branch.flows.p(b.side))
        })
        .sum()
}

/// Share of the slack mismatch owed by each area.
///
/// Every slack bus carries an equal part. A slack bus outside any area
/// splits its part over the areas reached first through the topology.
fn slack_shares(network: &Network) -> BTreeMap<AreaId, f64> {
    let mut slacks = network.slack_buses();
    if slacks.is_empty() {
        slacks.extend(choose_reference(network));
    }
    let per_slack = 1.0 / slacks.len().max(1) as f64;
    let mut shares = BTreeMap::new();
    for slack in slacks {
        if let Some(area) = network.bus(slack).and_then(|b| b.area) {
            *shares.entry(area).or_insert(0.0) += per_slack;
            continue;
        }
        let nearest = topology::nearest_areas(network, slack);
        let share = per_slack / nearest.len().max(1) as f64;
        for area in nearest {
            *shares.entry(area).or_insert(0.0) += share;
        }
    }
    shares
}

impl OuterLoop for AreaInterchangeOuterLoop {
    type Data = AreaInterchangeData;

    fn name(&self) -> &'static str {
        "area_interchange_control"
    }

    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<AreaInterchangeData> {
        let slack_shares = slack_shares(env.network);
        if slack_shares.is_empty() && !env.network.areas.is_empty() {
            warn!("slack bus not connected to any area, its mismatch is not distributed");
        }
        Ok(AreaInterchangeData {
            slack_shares,
            ..AreaInterchangeData::default()
        })
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<AreaInterchangeData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let slack_mismatch = ctx.last_solve.slack_bus_active_power_mismatch;

        let mut to_distribute: Vec<(AreaId, f64)> = Vec::new();
        for area in &env.network.areas {
            let actual = interchange(env.network, area);
            let share = ctx.data.slack_shares.get(&area.id).copied().unwrap_or(0.0);
            let mismatch = area.interchange_target - actual + share * slack_mismatch;
            if mismatch.abs() > self.tolerance(area).max(RESIDUAL_EPSILON) {
                debug!(
                    area = %area.id,
                    interchange_mw = actual * BASE_MVA,
                    target_mw = area.interchange_target * BASE_MVA,
                    mismatch_mw = mismatch * BASE_MVA,
                    "area interchange out of tolerance"
                );
                to_distribute.push((area.id, mismatch));
            }
        }
        if to_distribute.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let per_area: Vec<(AreaId, f64, Vec<Participant>)> = to_distribute
            .into_iter()
            .map(|(id, mismatch)| {
                let participants = self.distribution.participants(env.network, |bus| {
                    env.network.bus(bus).and_then(|b| b.area) == Some(id)
                });
                (id, mismatch, participants)
            })
            .collect();
        let all: Vec<Participant> =
            per_area.iter().flat_map(|(_, _, p)| p.iter().copied()).collect();
        let snapshot = TargetSnapshot::take(env.network, &all);
        let by_area_before = ctx.data.distributed_by_area.clone();

        let mut combined = DistributionResult {
            distributed: 0.0,
            remaining: 0.0,
            moved: false,
        };
        for (id, mismatch, participants) in &per_area {
            let result = self.distribution.run(env.network, participants, *mismatch);
            *ctx.data.distributed_by_area.entry(*id).or_insert(0.0) += result.distributed;
            combined.distributed += result.distributed;
            combined.remaining += result.remaining.abs();
            combined.moved |= result.moved;
        }

        let status = settle_distribution(
            self.failure_behavior,
            combined,
            &snapshot,
            env.network,
            &mut ctx.data.distributed,
        )?;
        if status == OuterLoopStatus::Failed {
            ctx.data.distributed_by_area = by_area_before;
        }
        Ok(status)
    }

    fn distributed_active_power(&self, data: &AreaInterchangeData) -> f64 {
        data.distributed
    }
}
