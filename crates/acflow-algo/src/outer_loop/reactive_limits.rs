//! Generator reactive limits: PV to PQ switching and back.
//!
//! A controller bus whose generators exceed their combined reactive limit is
//! switched to PQ with every controlling generator pinned at its own limit.
//! A bus switched this way returns to PV when its controlled voltage crosses
//! the target in the unlocking direction, at most `max_pq_pv_switch` times.

use std::collections::{BTreeMap, HashMap};

use acflow_core::{AcFlowResult, BusId, GenId, Network};
use tracing::{debug, info};

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};

const Q_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactiveLimit {
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct PqBus {
    pub limit: ReactiveLimit,
    pub generators: Vec<GenId>,
    pub controlled_bus: BusId,
    pub target_v: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ReactiveLimitsData {
    /// Buses this loop switched to PQ, keyed by generator bus
    pub pq_buses: BTreeMap<BusId, PqBus>,
    pub pq_pv_switches: HashMap<BusId, usize>,
}

#[derive(Debug, Clone)]
pub struct ReactiveLimitsOuterLoop {
    max_pq_pv_switch: usize,
}

impl ReactiveLimitsOuterLoop {
    pub fn new(max_pq_pv_switch: usize) -> Self {
        Self { max_pq_pv_switch }
    }
}

/// Generators regulating voltage from one bus, with their combined output and limits.
#[derive(Debug)]
struct ControllerBus {
    bus: BusId,
    generators: Vec<GenId>,
    controlled_bus: BusId,
    target_v: f64,
    q: f64,
    min_q: f64,
    max_q: f64,
    target_p: f64,
}

fn controller_buses(network: &Network) -> Vec<ControllerBus> {
    let mut by_bus: BTreeMap<BusId, ControllerBus> = BTreeMap::new();
    for gen in network.generators().filter(|g| g.is_voltage_controlling()) {
        let Some(vc) = gen.voltage_control.as_ref() else {
            continue;
        };
        let entry = by_bus.entry(gen.bus).or_insert_with(|| ControllerBus {
            bus: gen.bus,
            generators: Vec::new(),
            controlled_bus: vc.controlled_bus,
            target_v: vc.target_v,
            q: 0.0,
            min_q: 0.0,
            max_q: 0.0,
            target_p: 0.0,
        });
        entry.generators.push(gen.id);
        entry.q += gen.q;
        entry.min_q += gen.min_q;
        entry.max_q += gen.max_q;
        entry.target_p += gen.target_p;
    }
    by_bus.into_values().collect()
}

impl ReactiveLimitsOuterLoop {
    fn switch_pv_to_pq(&self, network: &mut Network, data: &mut ReactiveLimitsData) -> usize {
        let controllers = controller_buses(network);
        let mut violations: Vec<(&ControllerBus, ReactiveLimit)> = controllers
            .iter()
            .filter_map(|c| {
                if c.q > c.max_q + Q_EPSILON {
                    Some((c, ReactiveLimit::Max))
                } else if c.q < c.min_q - Q_EPSILON {
                    Some((c, ReactiveLimit::Min))
                } else {
                    None
                }
            })
            .collect();

        if !violations.is_empty() && violations.len() == controllers.len() {
            // Keep the strongest bus regulating voltage
            let kv = |bus: BusId| network.bus(bus).map_or(0.0, |b| b.nominal_kv);
            let strongest = violations
                .iter()
                .enumerate()
                .max_by(|(_, (a, _)), (_, (b, _))| {
                    kv(a.controlled_bus)
                        .total_cmp(&kv(b.controlled_bus))
                        .then(a.target_p.total_cmp(&b.target_p))
                        .then(b.bus.cmp(&a.bus))
                })
                .map(|(i, _)| i);
            if let Some(i) = strongest {
                let (kept, _) = violations.remove(i);
                info!(
                    bus = %kept.bus,
                    "all voltage controllers at limit, keeping strongest bus PV"
                );
            }
        }

        for (controller, limit) in &violations {
            for id in &controller.generators {
                if let Some(gen) = network.generator_mut(*id) {
                    gen.target_q = match limit {
                        ReactiveLimit::Max => gen.max_q,
                        ReactiveLimit::Min => gen.min_q,
                    };
                    if let Some(vc) = gen.voltage_control.as_mut() {
                        vc.enabled = false;
                    }
                }
            }
            debug!(
                bus = %controller.bus,
                q = controller.q,
                limit = ?limit,
                "switch PV -> PQ"
            );
            data.pq_buses.insert(
                controller.bus,
                PqBus {
                    limit: *limit,
                    generators: controller.generators.clone(),
                    controlled_bus: controller.controlled_bus,
                    target_v: controller.target_v,
                },
            );
        }
        violations.len()
    }

    fn switch_pq_to_pv(
        &self,
        network: &mut Network,
        data: &mut ReactiveLimitsData,
        skip: &[BusId],
    ) -> usize {
        let mut unlocked = Vec::new();
        for (bus, pq) in &data.pq_buses {
            if skip.contains(bus) {
                continue;
            }
            let switches = data.pq_pv_switches.get(bus).copied().unwrap_or(0);
            if switches >= self.max_pq_pv_switch {
                continue;
            }
            let Some(v) = network.bus(pq.controlled_bus).map(|b| b.v) else {
                continue;
            };
            let unlock = match pq.limit {
                ReactiveLimit::Max => v > pq.target_v,
                ReactiveLimit::Min => v < pq.target_v,
            };
            if unlock {
                unlocked.push(*bus);
            }
        }

        for bus in &unlocked {
            let Some(pq) = data.pq_buses.remove(bus) else {
                continue;
            };
            for id in &pq.generators {
                if let Some(vc) = network
                    .generator_mut(*id)
                    .and_then(|g| g.voltage_control.as_mut())
                {
                    vc.enabled = true;
                }
            }
            *data.pq_pv_switches.entry(*bus).or_insert(0) += 1;
            debug!(bus = %bus, limit = ?pq.limit, "switch PQ -> PV");
        }
        unlocked.len()
    }
}

impl OuterLoop for ReactiveLimitsOuterLoop {
    type Data = ReactiveLimitsData;

    fn name(&self) -> &'static str {
        "reactive_limits"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<ReactiveLimitsData> {
        Ok(ReactiveLimitsData::default())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<ReactiveLimitsData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let before: Vec<BusId> = ctx.data.pq_buses.keys().copied().collect();
        let switched_to_pq = self.switch_pv_to_pq(env.network, &mut ctx.data);
        let fresh: Vec<BusId> = ctx
            .data
            .pq_buses
            .keys()
            .filter(|b| !before.contains(b))
            .copied()
            .collect();
        let switched_to_pv = self.switch_pq_to_pv(env.network, &mut ctx.data, &fresh);

        if switched_to_pq + switched_to_pv > 0 {
            info!(switched_to_pq, switched_to_pv, "reactive limit switches");
            Ok(OuterLoopStatus::Unstable)
        } else {
            Ok(OuterLoopStatus::Stable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::AcLoadFlowParameters;
    use crate::solver::SolveResult;
    use crate::testing::FixedSensitivity;
    use acflow_core::*;

    fn network() -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "B1", 400.0)).unwrap();
        network.add_bus(Bus::new(BusId::new(2), "B2", 225.0)).unwrap();
        network
            .add_generator(
                Gen::new(GenId::new(1), "G1", BusId::new(1))
                    .with_q_limits(-1.0, 1.0)
                    .with_voltage_control(BusId::new(1), 1.0),
            )
            .unwrap();
        network
            .add_generator(
                Gen::new(GenId::new(2), "G2", BusId::new(2))
                    .with_q_limits(-0.2, 0.3)
                    .with_voltage_control(BusId::new(2), 1.05),
            )
            .unwrap();
        network
    }

    fn check(
        outer_loop: &ReactiveLimitsOuterLoop,
        ctx: &mut OuterLoopContext<ReactiveLimitsData>,
        network: &mut Network,
    ) -> OuterLoopStatus {
        let parameters = AcLoadFlowParameters::default();
        let sensitivity = FixedSensitivity::zero();
        let mut env = LoopEnv {
            network,
            sensitivity: &sensitivity,
            parameters: &parameters,
        };
        outer_loop.check(ctx, &mut env).unwrap()
    }

    fn context() -> OuterLoopContext<ReactiveLimitsData> {
        OuterLoopContext {
            iteration: 0,
            total_iterations: 0,
            last_solve: SolveResult::default(),
            data: ReactiveLimitsData::default(),
        }
    }

    #[test]
    fn test_single_violation_switches_to_pq_at_limit() {
        let mut network = network();
        network.generator_mut(GenId::new(2)).unwrap().q = 0.45;
        let outer_loop = ReactiveLimitsOuterLoop::new(3);
        let mut ctx = context();

        assert_eq!(check(&outer_loop, &mut ctx, &mut network), OuterLoopStatus::Unstable);
        let gen = network.generator(GenId::new(2)).unwrap();
        assert!(!gen.is_voltage_controlling());
        assert_eq!(gen.target_q, 0.3);
        assert!(network.generator(GenId::new(1)).unwrap().is_voltage_controlling());

        // still below target at Qmax: stays PQ
        network.generator_mut(GenId::new(2)).unwrap().q = 0.3;
        network.bus_mut(BusId::new(2)).unwrap().v = 1.03;
        assert_eq!(check(&outer_loop, &mut ctx, &mut network), OuterLoopStatus::Stable);
    }

    #[test]
    fn test_strongest_bus_kept_when_all_violate() {
        let mut network = network();
        network.generator_mut(GenId::new(1)).unwrap().q = 1.5;
        network.generator_mut(GenId::new(2)).unwrap().q = -0.5;
        let outer_loop = ReactiveLimitsOuterLoop::new(3);
        let mut ctx = context();
        assert_eq!(check(&outer_loop, &mut ctx, &mut network), OuterLoopStatus::Unstable);
        // 400 kV bus wins over 225 kV
        assert!(network.generator(GenId::new(1)).unwrap().is_voltage_controlling());
        assert!(!network.generator(GenId::new(2)).unwrap().is_voltage_controlling());
        assert_eq!(network.generator(GenId::new(2)).unwrap().target_q, -0.2);
    }

    #[test]
    fn test_pq_pv_switch_is_bounded() {
        let mut network = network();
        let outer_loop = ReactiveLimitsOuterLoop::new(2);
        let mut ctx = context();
        let mut unlocks = 0;
        for _ in 0..10 {
            // over Qmax while PV, over target voltage while PQ: oscillates
            network.generator_mut(GenId::new(2)).unwrap().q = 0.5;
            network.bus_mut(BusId::new(2)).unwrap().v = 1.06;
            check(&outer_loop, &mut ctx, &mut network);
            network.generator_mut(GenId::new(2)).unwrap().q = 0.3;
            if check(&outer_loop, &mut ctx, &mut network) == OuterLoopStatus::Unstable {
                unlocks += 1;
            }
        }
        assert_eq!(unlocks, 2);
        assert_eq!(ctx.data.pq_pv_switches[&BusId::new(2)], 2);
    }
}
