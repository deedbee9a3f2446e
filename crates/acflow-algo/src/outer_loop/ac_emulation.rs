//! HVDC AC emulation.
//!
//! [`AcEmulationOuterLoop`] moves links between the linear emulation law and
//! saturation at their directional limits. Each link may switch mode at most
//! `max_mode_switch` times per session.
//!
//! [`AcEmulationFreezeOuterLoop`] gives the rest of the session a warm start:
//! links are frozen at the power given by the current angle difference while
//! the network settles, then released at the first check with the voltages
//! captured at initialization put back.

use std::collections::{BTreeMap, HashMap};

use acflow_core::{AcEmulationStatus, AcFlowResult, BusId, HvdcId, HvdcLine, Network};
use tracing::{debug, info, warn};

use super::{LoopEnv, OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::parameters::HvdcFreezeMode;

fn terminal_angles(network: &Network, line: &HvdcLine) -> Option<(f64, f64)> {
    let a1 = network.bus(line.bus1)?.angle;
    let a2 = network.bus(line.bus2)?.angle;
    Some((a1, a2))
}

fn emulated_lines(network: &Network) -> impl Iterator<Item = &HvdcLine> {
    network.hvdc_lines().filter(|l| !l.disabled && l.ac_emulation.is_some())
}

#[derive(Debug, Clone, Default)]
pub struct AcEmulationData {
    pub mode_switches: HashMap<HvdcId, usize>,
}

#[derive(Debug, Clone)]
pub struct AcEmulationOuterLoop {
    max_mode_switch: usize,
}

impl AcEmulationOuterLoop {
    pub fn new(max_mode_switch: usize) -> Self {
        Self { max_mode_switch }
    }
}

/// Mode a link should be in for the given unsaturated emulated flow.
fn wanted_status(
    line: &HvdcLine,
    current: AcEmulationStatus,
    linear_flow: f64,
) -> (AcEmulationStatus, f64) {
    match current {
        AcEmulationStatus::Linear if linear_flow > line.p_max_12 => {
            (AcEmulationStatus::SaturatedSide1, line.p_max_12)
        }
        AcEmulationStatus::Linear if linear_flow < -line.p_max_21 => {
            (AcEmulationStatus::SaturatedSide2, -line.p_max_21)
        }
        AcEmulationStatus::SaturatedSide1 if linear_flow < line.p_max_12 => {
            (AcEmulationStatus::Linear, 0.0)
        }
        AcEmulationStatus::SaturatedSide2 if linear_flow > -line.p_max_21 => {
            (AcEmulationStatus::Linear, 0.0)
        }
        other => (other, f64::NAN),
    }
}

impl OuterLoop for AcEmulationOuterLoop {
    type Data = AcEmulationData;

    fn name(&self) -> &'static str {
        "ac_emulation"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<AcEmulationData> {
        Ok(AcEmulationData::default())
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<AcEmulationData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let mut changes = Vec::new();
        for line in emulated_lines(env.network) {
            let Some(emulation) = line.ac_emulation.as_ref() else {
                continue;
            };
            if emulation.status == AcEmulationStatus::Frozen {
                continue;
            }
            let Some((a1, a2)) = terminal_angles(env.network, line) else {
                continue;
            };
            let linear_flow = emulation.linear_flow(a1, a2);
            let (status, fixed_p) = wanted_status(line, emulation.status, linear_flow);
            if status == emulation.status {
                continue;
            }
            let switches = ctx.data.mode_switches.get(&line.id).copied().unwrap_or(0);
            if switches >= self.max_mode_switch {
                warn!(hvdc = %line.id, ?status, "AC emulation mode switch limit reached");
                continue;
            }
            changes.push((line.id, status, fixed_p, linear_flow));
        }

        for (id, status, fixed_p, linear_flow) in &changes {
            let Some(line) = env.network.hvdc_line_mut(*id) else {
                continue;
            };
            if let Some(emulation) = line.ac_emulation.as_mut() {
                emulation.status = *status;
                if *status != AcEmulationStatus::Linear {
                    emulation.fixed_p = *fixed_p;
                }
            }
            *ctx.data.mode_switches.entry(*id).or_insert(0) += 1;
            debug!(
                hvdc = %id,
                ?status,
                linear_flow,
                received = line.received_power(*fixed_p),
                "AC emulation mode switch"
            );
        }

        Ok(if changes.is_empty() {
            OuterLoopStatus::Stable
        } else {
            OuterLoopStatus::Unstable
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcEmulationFreezeData {
    /// Bus voltage and angle captured before freezing
    pub snapshot: BTreeMap<BusId, (f64, f64)>,
    pub frozen: Vec<HvdcId>,
}

#[derive(Debug, Clone)]
pub struct AcEmulationFreezeOuterLoop {
    scope: HvdcFreezeMode,
}

impl AcEmulationFreezeOuterLoop {
    pub fn new(scope: HvdcFreezeMode) -> Self {
        Self { scope }
    }

    fn in_scope(&self, line: &HvdcLine) -> bool {
        match self.scope {
            HvdcFreezeMode::None => false,
            HvdcFreezeMode::AllLinks => true,
            HvdcFreezeMode::Asymmetric => {
                line.p_max_12 != line.p_max_21 || line.loss_factor1 != line.loss_factor2
            }
        }
    }

    fn unfreeze(network: &mut Network, ids: &[HvdcId]) {
        for id in ids {
            let emulation = network.hvdc_line_mut(*id).and_then(|l| l.ac_emulation.as_mut());
            if let Some(emulation) = emulation.filter(|e| e.status == AcEmulationStatus::Frozen) {
                emulation.status = AcEmulationStatus::Linear;
            }
        }
    }
}

impl OuterLoop for AcEmulationFreezeOuterLoop {
    type Data = AcEmulationFreezeData;

    fn name(&self) -> &'static str {
        "ac_emulation_freeze"
    }

    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<AcEmulationFreezeData> {
        let snapshot = env.network.buses().map(|b| (b.id, (b.v, b.angle))).collect();
        let to_freeze: Vec<(HvdcId, f64)> = emulated_lines(env.network)
            .filter(|l| self.in_scope(l))
            .filter(|l| {
                l.ac_emulation
                    .as_ref()
                    .is_some_and(|e| e.status == AcEmulationStatus::Linear)
            })
            .filter_map(|l| {
                let (a1, a2) = terminal_angles(env.network, l)?;
                let flow = l.ac_emulation.as_ref()?.linear_flow(a1, a2);
                Some((l.id, flow.clamp(-l.p_max_21, l.p_max_12)))
            })
            .collect();

        let mut frozen = Vec::with_capacity(to_freeze.len());
        for (id, p) in to_freeze {
            if let Some(emulation) = env
                .network
                .hvdc_line_mut(id)
                .and_then(|l| l.ac_emulation.as_mut())
            {
                emulation.status = AcEmulationStatus::Frozen;
                emulation.fixed_p = p;
                frozen.push(id);
            }
        }
        if !frozen.is_empty() {
            info!(links = frozen.len(), "HVDC AC emulation frozen");
        }
        Ok(AcEmulationFreezeData { snapshot, frozen })
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<AcEmulationFreezeData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        if ctx.data.frozen.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }
        let released = std::mem::take(&mut ctx.data.frozen);
        Self::unfreeze(env.network, &released);
        for (id, (v, angle)) in &ctx.data.snapshot {
            if let Some(bus) = env.network.bus_mut(*id) {
                bus.v = *v;
                bus.angle = *angle;
            }
        }
        debug!(links = released.len(), "HVDC AC emulation released");
        Ok(OuterLoopStatus::Unstable)
    }

    fn cleanup(
        &self,
        ctx: &mut OuterLoopContext<AcEmulationFreezeData>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        Self::unfreeze(env.network, &ctx.data.frozen);
        ctx.data.frozen.clear();
        Ok(())
    }

    fn modifies_model_on_initialize(&self) -> bool {
        true
    }
}
