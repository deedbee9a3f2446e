//! Overload management automata.
//!
//! Each enabled system watches the current on one branch side and operates
//! its switch (opens or closes a branch) the first time the current exceeds
//! the threshold. A system operates at most once per session.

use std::collections::BTreeSet;

use acflow_core::AcFlowResult;
use tracing::info;

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};

#[derive(Debug, Clone, Default)]
pub struct AutomationSystemOuterLoop;

impl OuterLoop for AutomationSystemOuterLoop {
    /// Indexes of the systems that already operated
    type Data = BTreeSet<usize>;

    fn name(&self) -> &'static str {
        "automation_system"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<BTreeSet<usize>> {
        Ok(BTreeSet::new())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<BTreeSet<usize>>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let mut trips = Vec::new();
        for (index, system) in env.network.overload_management_systems.iter().enumerate() {
            if !system.enabled || ctx.data.contains(&index) {
                continue;
            }
            let Some(monitored) = env
                .network
                .branch(system.monitored_branch)
                .filter(|b| !b.disabled)
            else {
                continue;
            };
            let current = monitored.flows.i(system.monitored_side);
            if current <= system.threshold {
                continue;
            }
            let already = env
                .network
                .branch(system.switch_branch)
                .is_some_and(|b| b.disabled == system.open);
            if !already {
                trips.push((index, system.switch_branch, system.open, current));
            }
        }

        for (index, switch, open, current) in &trips {
            if let Some(branch) = env.network.branch_mut(*switch) {
                branch.disabled = *open;
                ctx.data.insert(*index);
                info!(
                    system = %env.network.overload_management_systems[*index].name,
                    switch = %switch,
                    open,
                    current,
                    "overload management system operated"
                );
            }
        }

        Ok(if trips.is_empty() {
            OuterLoopStatus::Stable
        } else {
            OuterLoopStatus::Unstable
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

    #[test]
    fn test_overload_opens_switch_once() {
        let mut network = Network::new();
        for i in 1..=3 {
            network.add_bus(Bus::new(BusId::new(i), format!("B{i}"), 225.0)).unwrap();
        }
        network
            .add_branch(Branch::new(
                BranchId::new(1),
                "L12",
                BusId::new(1),
                BusId::new(2),
                0.0,
                0.1,
            ))
            .unwrap();
        network
            .add_branch(Branch::new(
                BranchId::new(2),
                "L23",
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.1,
            ))
            .unwrap();
        network.overload_management_systems.push(OverloadManagementSystem {
            name: "OMS".into(),
            monitored_branch: BranchId::new(1),
            monitored_side: BranchSide::One,
            threshold: 1.0,
            switch_branch: BranchId::new(2),
            open: true,
            enabled: true,
        });
        network.branch_mut(BranchId::new(1)).unwrap().flows.i1 = 1.1;

        let parameters = AcLoadFlowParameters::default();
        let sensitivity = FixedSensitivity::zero();
        let mut env = LoopEnv {
            network: &mut network,
            sensitivity: &sensitivity,
            parameters: &parameters,
        };
        let mut ctx = OuterLoopContext {
            iteration: 0,
            total_iterations: 0,
            last_solve: SolveResult::default(),
            data: BTreeSet::new(),
        };
        let outer_loop = AutomationSystemOuterLoop;
        assert_eq!(outer_loop.check(&mut ctx, &mut env).unwrap(), OuterLoopStatus::Unstable);
        assert!(env.network.branch(BranchId::new(2)).unwrap().disabled);

        // closed again externally, still overloaded: no second operation
        env.network.branch_mut(BranchId::new(2)).unwrap().disabled = false;
        assert_eq!(outer_loop.check(&mut ctx, &mut env).unwrap(), OuterLoopStatus::Stable);
    }
}
