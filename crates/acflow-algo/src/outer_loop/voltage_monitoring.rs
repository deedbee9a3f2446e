//! Voltage monitoring: PQ buses whose voltage leaves its limits go back to PV.
//!
//! A generator with a disabled voltage control whose controlled bus voltage is
//! outside `[min_v, max_v]` is re-enabled with the violated limit as target.
//! Each controlled bus is switched at most once per session.

use std::collections::BTreeSet;

use acflow_core::{AcFlowResult, BusId};
use tracing::debug;

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};

#[derive(Debug, Clone, Default)]
pub struct VoltageMonitoringOuterLoop;

impl OuterLoop for VoltageMonitoringOuterLoop {
    type Data = BTreeSet<BusId>;

    fn name(&self) -> &'static str {
        "voltage_monitoring"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<BTreeSet<BusId>> {
        Ok(BTreeSet::new())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<BTreeSet<BusId>>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let mut switches = Vec::new();
        for gen in env.network.generators().filter(|g| !g.disabled) {
            let Some(vc) = gen.voltage_control.as_ref().filter(|vc| !vc.enabled) else {
                continue;
            };
            if ctx.data.contains(&vc.controlled_bus) {
                continue;
            }
            let Some(bus) = env.network.bus(vc.controlled_bus) else {
                continue;
            };
            let target = match (bus.min_v, bus.max_v) {
                (Some(min_v), _) if bus.v < min_v => min_v,
                (_, Some(max_v)) if bus.v > max_v => max_v,
                _ => continue,
            };
            switches.push((gen.id, vc.controlled_bus, target));
        }

        let mut switched = BTreeSet::new();
        for (id, controlled_bus, target) in switches {
            if let Some(vc) = env
                .network
                .generator_mut(id)
                .and_then(|g| g.voltage_control.as_mut())
            {
                vc.enabled = true;
                vc.target_v = target;
                switched.insert(controlled_bus);
                debug!(
                    generator = %id,
                    bus = %controlled_bus,
                    target,
                    "voltage limit violated, switch PQ -> PV"
                );
            }
        }
        let changed = !switched.is_empty();
        ctx.data.extend(switched);
        Ok(if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }
}
