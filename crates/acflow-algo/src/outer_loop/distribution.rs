//! Active power distribution over participating generators or loads.
//!
//! Shares are proportional to a per-participant factor chosen by the
//! [`BalanceType`]. Generators that hit a limit are clamped and drop out, and
//! the remainder is spread again over the others until nothing moves.

use acflow_core::{GenId, LoadId, Network};
use tracing::trace;

use crate::parameters::BalanceType;

const EPSILON: f64 = 1e-9;
const MAX_ROUNDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    Generator(GenId),
    Load(LoadId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistributionResult {
    /// Power actually moved onto participants (p.u.)
    pub distributed: f64,
    /// Power that could not be placed (p.u.)
    pub remaining: f64,
    /// True if any participant target changed
    pub moved: bool,
}

/// Previous targets of a set of participants, restorable bit for bit.
#[derive(Debug, Clone, Default)]
pub struct TargetSnapshot(Vec<(Participant, f64)>);

impl TargetSnapshot {
    pub fn take(network: &Network, participants: &[Participant]) -> Self {
        let saved = participants
            .iter()
            .filter_map(|p| target_of(network, *p).map(|t| (*p, t)))
            .collect();
        Self(saved)
    }

    pub fn restore(&self, network: &mut Network) {
        for (participant, value) in &self.0 {
            set_target(network, *participant, *value);
        }
    }
}

fn target_of(network: &Network, participant: Participant) -> Option<f64> {
    match participant {
        Participant::Generator(id) => network.generator(id).map(|g| g.target_p),
        Participant::Load(id) => network.load(id).map(|l| l.p),
    }
}

fn set_target(network: &mut Network, participant: Participant, value: f64) {
    match participant {
        Participant::Generator(id) => {
            if let Some(gen) = network.generator_mut(id) {
                gen.target_p = value;
            }
        }
        Participant::Load(id) => {
            if let Some(load) = network.load_mut(id) {
                load.p = value;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActivePowerDistribution {
    balance_type: BalanceType,
}

impl ActivePowerDistribution {
    pub fn new(balance_type: BalanceType) -> Self {
        Self { balance_type }
    }

    pub fn balance_type(&self) -> BalanceType {
        self.balance_type
    }

    /// Participants of the configured balance type, restricted by `keep` (bus filter).
    pub fn participants(
        &self,
        network: &Network,
        keep: impl Fn(acflow_core::BusId) -> bool,
    ) -> Vec<Participant> {
        match self.balance_type {
            BalanceType::ProportionalToLoad => network
                .loads()
                .filter(|l| l.participating && !l.disabled && keep(l.bus))
                .map(|l| Participant::Load(l.id))
                .collect(),
            _ => network
                .generators()
                .filter(|g| g.participating && !g.disabled && keep(g.bus))
                .map(|g| Participant::Generator(g.id))
                .collect(),
        }
    }

    /// Weight of one participant for a mismatch of the given sign.
    fn factor(&self, network: &Network, participant: Participant, mismatch: f64) -> f64 {
        match participant {
            Participant::Generator(id) => {
                let Some(gen) = network.generator(id) else {
                    return 0.0;
                };
                let raw = match self.balance_type {
                    BalanceType::ProportionalToGenerationP => gen.target_p.abs(),
                    BalanceType::ProportionalToGenerationPMax => {
                        if gen.max_p.is_finite() {
                            gen.max_p
                        } else {
                            0.0
                        }
                    }
                    BalanceType::ProportionalToGenerationRemainingMargin => {
                        let margin = if mismatch > 0.0 {
                            gen.max_p - gen.target_p
                        } else {
                            gen.target_p - gen.min_p
                        };
                        if margin.is_finite() {
                            margin.max(0.0)
                        } else {
                            0.0
                        }
                    }
                    BalanceType::ProportionalToLoad => 0.0,
                };
                raw * gen.participation_factor
            }
            Participant::Load(id) => network.load(id).map_or(0.0, |l| l.p.abs()),
        }
    }

    /// Spread `mismatch` (p.u.) over `participants`.
    ///
    /// A positive mismatch raises generator targets or lowers loads.
    pub fn run(
        &self,
        network: &mut Network,
        participants: &[Participant],
        mismatch: f64,
    ) -> DistributionResult {
        let mut remaining = mismatch;
        let mut active: Vec<Participant> = participants.to_vec();
        let mut moved = false;

        for round in 0..MAX_ROUNDS {
            if remaining.abs() < EPSILON || active.is_empty() {
                break;
            }
            let factors: Vec<f64> =
                active.iter().map(|p| self.factor(network, *p, mismatch)).collect();
            let total: f64 = factors.iter().sum();
            if total <= EPSILON {
                break;
            }

            let mut done = 0.0;
            let mut still_active = Vec::with_capacity(active.len());
            for (participant, factor) in active.iter().zip(&factors) {
                if *factor <= 0.0 {
                    continue;
                }
                let share = remaining * factor / total;
                let (change, saturated) = apply_share(network, *participant, share);
                if change != 0.0 {
                    moved = true;
                }
                done += change;
                if !saturated {
                    still_active.push(*participant);
                }
            }
            trace!(round, done, remaining, participants = still_active.len(), "distribution round");
            remaining -= done;
            active = still_active;
            if done.abs() < EPSILON {
                break;
            }
        }

        DistributionResult {
            distributed: mismatch - remaining,
            remaining,
            moved,
        }
    }
}

/// Apply one share; returns the realised change and whether the participant saturated.
fn apply_share(network: &mut Network, participant: Participant, share: f64) -> (f64, bool) {
    match participant {
        Participant::Generator(id) => {
            let Some(gen) = network.generator_mut(id) else {
                return (0.0, true);
            };
            let before = gen.target_p;
            if gen.min_p > gen.max_p
                || (share > 0.0 && before >= gen.max_p)
                || (share < 0.0 && before <= gen.min_p)
            {
                return (0.0, true);
            }
            let wanted = before + share;
            let clamped = wanted.clamp(gen.min_p, gen.max_p);
            gen.target_p = clamped;
            (clamped - before, clamped != wanted)
        }
        Participant::Load(id) => {
            let Some(load) = network.load_mut(id) else {
                return (0.0, true);
            };
            load.p -= share;
            (share, false)
        }
    }
}
