//! Outer-loop framework.
//!
//! An outer loop inspects the network after a nonlinear solve and decides
//! whether a discrete correction is needed (switch a bus PV to PQ, move a tap,
//! redistribute slack power...). Loops are organised in groups that alternate
//! checks and solves until a fixed point, a failure or the iteration ceiling.
//!
//! This module defines the contract between the groups and the loops:
//!
//! - **[`OuterLoop`]**: a loop with strongly typed per-session data
//! - **[`OuterLoopContext`]**: the data plus iteration counters and the last solve
//! - **[`CorrectionUnit`]**: either a loop (type-erased) or a nested group
//! - **[`RunningContext`]**: session-wide bookkeeping shared by all groups

use std::collections::BTreeMap;

use acflow_core::{AcFlowResult, Network};
use serde::{Deserialize, Serialize};

use crate::parameters::AcLoadFlowParameters;
use crate::sensitivity::SensitivityService;
use crate::solver::SolveResult;

pub mod ac_emulation;
pub mod area_interchange;
pub mod automation;
pub mod distributed_slack;
pub mod distribution;
pub mod group;
pub mod incremental;
pub mod phase_control;
pub mod reactive_limits;
pub mod secondary_voltage;
pub mod shunt_voltage;
pub mod transformer_reactive;
pub mod transformer_voltage;
pub mod voltage_monitoring;

pub use group::OuterLoopGroup;

/// Verdict of one outer-loop check, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OuterLoopStatus {
    /// Fixed point reached; a group reports this when none of its loops moves
    FullStable,
    /// Nothing to correct
    Stable,
    /// The model was modified and must be solved again
    Unstable,
    /// The loop cannot reach a valid state
    Failed,
}

impl OuterLoopStatus {
    /// Worst of two statuses.
    pub fn combine(self, other: OuterLoopStatus) -> OuterLoopStatus {
        self.max(other)
    }
}

/// What a loop sees when it is initialized, checked or cleaned up.
pub struct LoopEnv<'a> {
    pub network: &'a mut Network,
    pub sensitivity: &'a dyn SensitivityService,
    pub parameters: &'a AcLoadFlowParameters,
}

/// Per-loop state for one group entry.
#[derive(Debug, Clone)]
pub struct OuterLoopContext<D> {
    /// Re-solves triggered by this loop since the group was entered
    pub iteration: usize,
    /// Re-solves triggered by all loops in the session
    pub total_iterations: usize,
    pub last_solve: SolveResult,
    pub data: D,
}

/// A discrete correction step run between two nonlinear solves.
///
/// Loops hold their configuration in `self` and every mutable value in
/// [`OuterLoop::Data`], so the same loop value can be re-entered safely.
pub trait OuterLoop: Send {
    /// Per-session state, created by `initialize`
    type Data: Send;

    /// Stable identifier used for per-type iteration counters and logs
    fn name(&self) -> &'static str;

    /// Build the loop data; may adjust the network before the first check
    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<Self::Data>;

    /// Inspect the last solve and possibly modify the network
    fn check(
        &self,
        ctx: &mut OuterLoopContext<Self::Data>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus>;

    /// Undo temporary model changes when the group exits
    fn cleanup(
        &self,
        _ctx: &mut OuterLoopContext<Self::Data>,
        _env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        Ok(())
    }

    /// Active power moved by this loop during the session (p.u.)
    fn distributed_active_power(&self, _data: &Self::Data) -> f64 {
        0.0
    }

    /// True if `initialize` changes the model so that a solve is needed before checking
    fn modifies_model_on_initialize(&self) -> bool {
        false
    }
}

/// Object-safe view of an [`OuterLoop`] together with its context.
pub trait ErasedLoop: Send {
    fn name(&self) -> &'static str;
    fn modifies_model_on_initialize(&self) -> bool;
    fn is_initialized(&self) -> bool;
    fn initialize(&mut self, running: &RunningContext, env: &mut LoopEnv<'_>) -> AcFlowResult<()>;
    fn check(
        &mut self,
        running: &RunningContext,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus>;
    /// Count one re-solve triggered by this loop
    fn record_iteration(&mut self);
    /// Run cleanup and drop the context; returns the distributed active power
    fn cleanup(&mut self, env: &mut LoopEnv<'_>) -> AcFlowResult<f64>;
}

struct LoopSlot<L: OuterLoop> {
    outer_loop: L,
    context: Option<OuterLoopContext<L::Data>>,
}

impl<L: OuterLoop> ErasedLoop for LoopSlot<L> {
    fn name(&self) -> &'static str {
        self.outer_loop.name()
    }

    fn modifies_model_on_initialize(&self) -> bool {
        self.outer_loop.modifies_model_on_initialize()
    }

    fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    fn initialize(&mut self, running: &RunningContext, env: &mut LoopEnv<'_>) -> AcFlowResult<()> {
        let data = self.outer_loop.initialize(env)?;
        self.context = Some(OuterLoopContext {
            iteration: 0,
            total_iterations: running.outer_loop_total_iterations,
            last_solve: running.last_solve,
            data,
        });
        Ok(())
    }

    fn check(
        &mut self,
        running: &RunningContext,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let Some(ctx) = self.context.as_mut() else {
            return Err(acflow_core::AcFlowError::Other(format!(
                "outer loop '{}' checked before initialization",
                self.outer_loop.name()
            )));
        };
        ctx.total_iterations = running.outer_loop_total_iterations;
        ctx.last_solve = running.last_solve;
        self.outer_loop.check(ctx, env)
    }

    fn record_iteration(&mut self) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.iteration += 1;
        }
    }

    fn cleanup(&mut self, env: &mut LoopEnv<'_>) -> AcFlowResult<f64> {
        let Some(mut ctx) = self.context.take() else {
            return Ok(0.0);
        };
        let distributed = self.outer_loop.distributed_active_power(&ctx.data);
        self.outer_loop.cleanup(&mut ctx, env)?;
        Ok(distributed)
    }
}

/// Element of a group: a single loop or a nested group.
pub enum CorrectionUnit {
    Loop(Box<dyn ErasedLoop>),
    Group(OuterLoopGroup),
}

impl CorrectionUnit {
    pub fn outer_loop<L: OuterLoop + 'static>(outer_loop: L) -> Self {
        CorrectionUnit::Loop(Box::new(LoopSlot {
            outer_loop,
            context: None,
        }))
    }

    pub fn group(group: OuterLoopGroup) -> Self {
        CorrectionUnit::Group(group)
    }

    pub fn name(&self) -> &str {
        match self {
            CorrectionUnit::Loop(l) => l.name(),
            CorrectionUnit::Group(g) => g.name(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, CorrectionUnit::Group(_))
    }

    /// Loop names in execution order, nested groups flattened.
    pub fn loop_names(&self) -> Vec<&str> {
        match self {
            CorrectionUnit::Loop(l) => vec![l.name()],
            CorrectionUnit::Group(g) => g.loop_names(),
        }
    }
}

impl std::fmt::Debug for CorrectionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrectionUnit::Loop(l) => f.debug_tuple("Loop").field(&l.name()).finish(),
            CorrectionUnit::Group(g) => f.debug_tuple("Group").field(&g.name()).finish(),
        }
    }
}

/// Session-wide bookkeeping shared by every group of one load flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningContext {
    pub last_solve: SolveResult,
    /// Re-solves triggered per loop name
    pub iterations_by_loop: BTreeMap<String, usize>,
    pub outer_loop_total_iterations: usize,
    pub last_outer_loop_status: Option<OuterLoopStatus>,
    /// Active power moved by slack distribution (p.u.)
    pub distributed_active_power: f64,
    pub solver_total_iterations: usize,
    pub solve_count: usize,
}

impl RunningContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations_of(&self, name: &str) -> usize {
        self.iterations_by_loop.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn record_solve(&mut self, result: SolveResult) {
        self.solver_total_iterations += result.iterations;
        self.solve_count += 1;
        self.last_solve = result;
    }

    pub(crate) fn record_loop_iteration(&mut self, name: &str) {
        *self.iterations_by_loop.entry(name.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combination_is_worst_wins() {
        use OuterLoopStatus::*;
        assert_eq!(FullStable.combine(Stable), Stable);
        assert_eq!(Unstable.combine(Stable), Unstable);
        assert_eq!(Unstable.combine(Failed), Failed);
        assert_eq!(FullStable.combine(FullStable), FullStable);
    }

    #[test]
    fn test_running_context_counters() {
        let mut running = RunningContext::new();
        running.record_loop_iteration("reactive_limits");
        running.record_loop_iteration("reactive_limits");
        assert_eq!(running.iterations_of("reactive_limits"), 2);
        assert_eq!(running.iterations_of("phase_control"), 0);

        running.record_solve(SolveResult {
            status: crate::solver::SolverStatus::Converged,
            iterations: 4,
            slack_bus_active_power_mismatch: 0.0,
        });
        assert_eq!(running.solve_count, 1);
        assert_eq!(running.solver_total_iterations, 4);
    }

    #[test]
    fn test_erased_loop_is_object_safe() {
        fn _accepts(_l: &dyn ErasedLoop) {}
        fn _assert_send<T: Send>() {}
        _assert_send::<CorrectionUnit>();
    }
}
