//! Secondary (pilot point) voltage control.
//!
//! For a zone whose pilot bus is off target, every generator regulating one of
//! the zone's controlled buses takes the same reactive power shift `dq`.
//! Two sensitivity requests give the chain
//! `dVpilot/dq = sum_c dVpilot/dVc * sum_k dVc/dQk`; the controlled bus
//! voltages predicted for that shift become the new primary targets,
//! clamped to the bus voltage limits.

use std::collections::BTreeMap;

use acflow_core::{AcFlowResult, BusId, GenId, Network, VoltageControlZone};
use tracing::{debug, warn};

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::sensitivity::{ControlVariable, MonitoredQuantity, SensitivityRequest};

const SENSITIVITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct SecondaryVoltageOuterLoop {
    deadband: f64,
}

impl SecondaryVoltageOuterLoop {
    pub fn new(deadband: f64) -> Self {
        Self { deadband }
    }
}

/// Generators of a zone grouped by controlled bus, with their controller buses.
struct ZoneControllers {
    by_controlled: BTreeMap<BusId, Vec<GenId>>,
    controller_buses: Vec<BusId>,
}

fn zone_controllers(network: &Network, zone: &VoltageControlZone) -> ZoneControllers {
    let mut by_controlled: BTreeMap<BusId, Vec<GenId>> = BTreeMap::new();
    let mut controller_buses = Vec::new();
    for gen in network.generators().filter(|g| g.is_voltage_controlling()) {
        let Some(vc) = gen.voltage_control.as_ref() else {
            continue;
        };
        if zone.controlled_buses.contains(&vc.controlled_bus) {
            by_controlled.entry(vc.controlled_bus).or_default().push(gen.id);
            if !controller_buses.contains(&gen.bus) {
                controller_buses.push(gen.bus);
            }
        }
    }
    ZoneControllers {
        by_controlled,
        controller_buses,
    }
}

impl SecondaryVoltageOuterLoop {
    /// New targets for the zone, or `None` when the pilot cannot be moved.
    fn zone_targets(
        &self,
        env: &LoopEnv<'_>,
        zone: &VoltageControlZone,
    ) -> AcFlowResult<Option<Vec<(BusId, f64)>>> {
        let Some(pilot_v) = env.network.bus(zone.pilot_bus).map(|b| b.v) else {
            return Ok(None);
        };
        let deviation = zone.target_v - pilot_v;
        if deviation.abs() <= self.deadband {
            return Ok(None);
        }
        let controllers = zone_controllers(env.network, zone);
        if controllers.by_controlled.is_empty() {
            return Ok(None);
        }
        let controlled: Vec<BusId> = controllers.by_controlled.keys().copied().collect();

        let pilot = MonitoredQuantity::BusVoltage(zone.pilot_bus);
        let to_pilot = env.sensitivity.compute(
            env.network,
            &SensitivityRequest::new(
                controlled.iter().map(|b| ControlVariable::VoltageTarget(*b)).collect(),
                vec![pilot],
            ),
        )?;
        let to_controlled = env.sensitivity.compute(
            env.network,
            &SensitivityRequest::new(
                controllers
                    .controller_buses
                    .iter()
                    .map(|b| ControlVariable::BusReactiveInjection(*b))
                    .collect(),
                controlled.iter().map(|b| MonitoredQuantity::BusVoltage(*b)).collect(),
            )
            .with_released_buses(controllers.controller_buses.iter().copied()),
        )?;

        // dVc/dq for a uniform shift on every controller bus
        let per_shift: Vec<f64> = controlled
            .iter()
            .map(|c| {
                controllers
                    .controller_buses
                    .iter()
                    .filter_map(|k| {
                        to_controlled.get(
                            ControlVariable::BusReactiveInjection(*k),
                            MonitoredQuantity::BusVoltage(*c),
                        )
                    })
                    .sum()
            })
            .collect();
        let pilot_per_shift: f64 = controlled
            .iter()
            .zip(&per_shift)
            .map(|(c, s)| {
                to_pilot.get(ControlVariable::VoltageTarget(*c), pilot).unwrap_or(0.0) * s
            })
            .sum();
        if pilot_per_shift.abs() < SENSITIVITY_EPSILON {
            warn!(zone = %zone.name, "pilot bus voltage insensitive to its controllers");
            return Ok(None);
        }
        let dq = deviation / pilot_per_shift;

        let mut targets = Vec::with_capacity(controlled.len());
        for (c, s) in controlled.iter().zip(&per_shift) {
            let Some(bus) = env.network.bus(*c) else {
                continue;
            };
            let mut target = bus.v + s * dq;
            if let Some(min_v) = bus.min_v {
                target = target.max(min_v);
            }
            if let Some(max_v) = bus.max_v {
                target = target.min(max_v);
            }
            targets.push((*c, target));
        }
        debug!(zone = %zone.name, pilot_v, deviation, dq, "secondary voltage shift");
        Ok(Some(targets))
    }
}

impl OuterLoop for SecondaryVoltageOuterLoop {
    type Data = ();

    fn name(&self) -> &'static str {
        "secondary_voltage_control"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<()> {
        Ok(())
    }

    fn check(
        &self,
        _ctx: &mut OuterLoopContext<()>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let zones: Vec<VoltageControlZone> = env
            .network
            .voltage_control_zones
            .iter()
            .filter(|z| z.enabled)
            .cloned()
            .collect();

        let mut changed = false;
        for zone in &zones {
            let Some(targets) = self.zone_targets(env, zone)? else {
                continue;
            };
            for (controlled_bus, target) in targets {
                for gen in env.network.generators_mut() {
                    let Some(vc) = gen.voltage_control.as_mut() else {
                        continue;
                    };
                    if vc.enabled
                        && vc.controlled_bus == controlled_bus
                        && (vc.target_v - target).abs() > 1e-12
                    {
                        vc.target_v = target;
                        changed = true;
                    }
                }
            }
        }
        Ok(if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }
}
