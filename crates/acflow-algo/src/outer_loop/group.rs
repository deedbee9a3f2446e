//! Outer-loop groups.
//!
//! A *simple* group checks its units in order and re-solves after every
//! `Unstable` verdict. A *compensation* group first runs one compensation
//! unit to completion, then checks all its checkers once and re-solves a
//! single time for the combined verdict.
//!
//! Both kinds stop on a fixed point, a `Failed` verdict, a non-converged
//! solve or the session-wide iteration ceiling. Units are initialized in list
//! order and cleaned up in reverse order on every exit path.

use tracing::{debug, info, warn};

use acflow_core::AcFlowResult;

use super::{CorrectionUnit, LoopEnv, OuterLoopStatus, RunningContext};
use crate::solver::{PowerFlowSolver, VoltageInitializer};

enum Layout {
    Simple(Vec<CorrectionUnit>),
    Compensation {
        compensation: Box<CorrectionUnit>,
        checkers: Vec<CorrectionUnit>,
    },
}

/// Ordered set of correction units iterated to a fixed point.
pub struct OuterLoopGroup {
    name: String,
    layout: Layout,
    entered: bool,
}

impl std::fmt::Debug for OuterLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OuterLoopGroup")
            .field("name", &self.name)
            .field("loops", &self.loop_names())
            .finish()
    }
}

/// Everything a group needs to check units and trigger solves.
struct Session<'s, 'e> {
    running: &'s mut RunningContext,
    solver: &'s dyn PowerFlowSolver,
    env: &'s mut LoopEnv<'e>,
}

impl Session<'_, '_> {
    fn ceiling_reached(&self) -> bool {
        self.running.outer_loop_total_iterations >= self.env.parameters.max_outer_loop_iterations
    }

    fn solve(&mut self, initializer: VoltageInitializer) -> AcFlowResult<()> {
        let result = self.solver.solve(&mut *self.env.network, initializer)?;
        debug!(
            status = ?result.status,
            iterations = result.iterations,
            slack_mismatch = result.slack_bus_active_power_mismatch,
            "solve"
        );
        self.running.record_solve(result);
        Ok(())
    }

    fn converged(&self) -> bool {
        self.running.last_solve.is_converged()
    }

    /// Count a re-solve requested by `unit` and solve from the previous state.
    fn resolve_for(&mut self, unit: &mut CorrectionUnit) -> AcFlowResult<()> {
        self.count_iteration(unit);
        self.running.outer_loop_total_iterations += 1;
        self.solve(VoltageInitializer::Previous)
    }

    fn count_iteration(&mut self, unit: &mut CorrectionUnit) {
        self.running.record_loop_iteration(unit.name());
        if let CorrectionUnit::Loop(l) = unit {
            l.record_iteration();
        }
    }

    fn check(&mut self, unit: &mut CorrectionUnit) -> AcFlowResult<OuterLoopStatus> {
        let status = match unit {
            CorrectionUnit::Loop(l) => {
                if !l.is_initialized() {
                    l.initialize(self.running, self.env)?;
                }
                l.check(self.running, self.env)?
            }
            CorrectionUnit::Group(g) => g.check_nested(self)?,
        };
        debug!(
            outer_loop = unit.name(),
            iteration = self.running.outer_loop_total_iterations,
            status = ?status,
            "outer loop check"
        );
        self.running.last_outer_loop_status = Some(status);
        Ok(status)
    }
}

/// Flags collected over one pass.
#[derive(Default)]
struct Pass {
    full_stable: bool,
    unstable: bool,
    failed: bool,
    halted: bool,
}

impl Pass {
    fn note(&mut self, status: OuterLoopStatus) {
        match status {
            OuterLoopStatus::FullStable => self.full_stable = true,
            OuterLoopStatus::Unstable => self.unstable = true,
            OuterLoopStatus::Failed => self.failed = true,
            OuterLoopStatus::Stable => {}
        }
    }
}

impl OuterLoopGroup {
    pub fn simple(name: impl Into<String>, units: Vec<CorrectionUnit>) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Simple(units),
            entered: false,
        }
    }

    /// Group that settles `compensation` before each joint check of `checkers`.
    pub fn compensation(
        name: impl Into<String>,
        compensation: CorrectionUnit,
        checkers: Vec<CorrectionUnit>,
    ) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Compensation {
                compensation: Box::new(compensation),
                checkers,
            },
            entered: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        match &self.layout {
            Layout::Simple(units) => units.is_empty(),
            Layout::Compensation { .. } => false,
        }
    }

    pub fn loop_names(&self) -> Vec<&str> {
        self.units().flat_map(|u| u.loop_names()).collect()
    }

    fn units(&self) -> Box<dyn Iterator<Item = &CorrectionUnit> + '_> {
        match &self.layout {
            Layout::Simple(units) => Box::new(units.iter()),
            Layout::Compensation { compensation, checkers } => {
                Box::new(std::iter::once(compensation.as_ref()).chain(checkers.iter()))
            }
        }
    }

    fn units_mut(&mut self) -> Vec<&mut CorrectionUnit> {
        match &mut self.layout {
            Layout::Simple(units) => units.iter_mut().collect(),
            Layout::Compensation { compensation, checkers } => {
                std::iter::once(compensation.as_mut()).chain(checkers.iter_mut()).collect()
            }
        }
    }

    /// Run the group as the root of a session: enter, iterate, exit.
    ///
    /// The first solve of the session happens on entry. Cleanup runs even
    /// when a loop or the solver returns an error.
    pub fn run(
        &mut self,
        running: &mut RunningContext,
        solver: &dyn PowerFlowSolver,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        let mut session = Session { running, solver, env };
        let outcome = self.enter(&mut session).and_then(|()| self.iterate(&mut session));
        let cleanup = self.exit(&mut session);
        let status = outcome?;
        cleanup?;
        info!(
            group = %self.name,
            status = ?status,
            outer_loop_iterations = session.running.outer_loop_total_iterations,
            solver_iterations = session.running.solver_total_iterations,
            "outer loops done"
        );
        Ok(status)
    }

    /// Initialize units in order and bring the model to a solved state.
    fn enter(&mut self, session: &mut Session<'_, '_>) -> AcFlowResult<()> {
        self.entered = true;
        let mut modified = false;
        for unit in self.units_mut() {
            if let CorrectionUnit::Loop(l) = unit {
                l.initialize(session.running, session.env)?;
                modified |= l.modifies_model_on_initialize();
            }
        }
        if session.running.solve_count == 0 {
            let initializer = session.env.parameters.voltage_init_mode.initializer();
            session.solve(initializer)?;
        } else if modified {
            session.solve(VoltageInitializer::Previous)?;
        }
        Ok(())
    }

    /// Run as a unit of a parent group; entered lazily on first check.
    fn check_nested(&mut self, session: &mut Session<'_, '_>) -> AcFlowResult<OuterLoopStatus> {
        if !self.entered {
            self.enter(session)?;
        }
        self.iterate(session)
    }

    fn iterate(&mut self, session: &mut Session<'_, '_>) -> AcFlowResult<OuterLoopStatus> {
        if self.is_empty() {
            return Ok(OuterLoopStatus::FullStable);
        }
        let mut failed = false;
        while session.converged() && !session.ceiling_reached() {
            let solver_iterations = session.running.solver_total_iterations;
            let pass = match &mut self.layout {
                Layout::Simple(units) => simple_pass(units, session)?,
                Layout::Compensation { compensation, checkers } => {
                    compensation_pass(compensation, checkers, session)?
                }
            };
            if pass.failed {
                failed = true;
                break;
            }
            let progressed = session.running.solver_total_iterations > solver_iterations;
            if pass.halted || !(progressed || (pass.full_stable && pass.unstable)) {
                break;
            }
        }

        let status = if failed {
            OuterLoopStatus::Failed
        } else if session.ceiling_reached() || !session.converged() {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::FullStable
        };
        if status == OuterLoopStatus::Unstable && session.ceiling_reached() {
            warn!(group = %self.name, "outer loop iteration ceiling reached");
        }
        Ok(status)
    }

    /// Clean up units in reverse order; nested groups exit recursively.
    fn exit(&mut self, session: &mut Session<'_, '_>) -> AcFlowResult<()> {
        if !self.entered {
            return Ok(());
        }
        self.entered = false;
        let mut first_error = None;
        for unit in self.units_mut().into_iter().rev() {
            let result = match unit {
                CorrectionUnit::Loop(l) => l.cleanup(session.env).map(|distributed| {
                    session.running.distributed_active_power += distributed;
                }),
                CorrectionUnit::Group(g) => g.exit(session),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn simple_pass(units: &mut [CorrectionUnit], session: &mut Session<'_, '_>) -> AcFlowResult<Pass> {
    let mut pass = Pass::default();
    for unit in units.iter_mut() {
        let status = session.check(unit)?;
        pass.note(status);
        // a nested group may have left a diverged solve behind
        if !session.converged() {
            pass.halted = true;
            break;
        }
        match status {
            OuterLoopStatus::FullStable | OuterLoopStatus::Stable => {}
            OuterLoopStatus::Unstable => {
                // nested groups re-solve for themselves
                if session.ceiling_reached() || unit.is_group() {
                    pass.halted = true;
                    break;
                }
                session.resolve_for(unit)?;
                if !session.converged() || session.ceiling_reached() {
                    pass.halted = true;
                    break;
                }
            }
            OuterLoopStatus::Failed => break,
        }
    }
    Ok(pass)
}

fn compensation_pass(
    compensation: &mut CorrectionUnit,
    checkers: &mut [CorrectionUnit],
    session: &mut Session<'_, '_>,
) -> AcFlowResult<Pass> {
    let mut pass = Pass::default();
    loop {
        let status = session.check(compensation)?;
        pass.note(status);
        if !session.converged() {
            pass.halted = true;
            return Ok(pass);
        }
        match status {
            OuterLoopStatus::Unstable => {
                if session.ceiling_reached() || compensation.is_group() {
                    pass.halted = true;
                    return Ok(pass);
                }
                session.resolve_for(compensation)?;
                if !session.converged() || session.ceiling_reached() {
                    pass.halted = true;
                    return Ok(pass);
                }
            }
            OuterLoopStatus::Failed => return Ok(pass),
            OuterLoopStatus::FullStable | OuterLoopStatus::Stable => break,
        }
    }

    let mut combined = OuterLoopStatus::FullStable;
    let mut unstable = Vec::new();
    for (i, checker) in checkers.iter_mut().enumerate() {
        let status = session.check(checker)?;
        pass.note(status);
        if !session.converged() {
            pass.halted = true;
            return Ok(pass);
        }
        combined = combined.combine(status);
        if status == OuterLoopStatus::Unstable {
            if checker.is_group() {
                pass.halted = true;
                return Ok(pass);
            }
            unstable.push(i);
        }
    }
    session.running.last_outer_loop_status = Some(combined);

    if combined == OuterLoopStatus::Unstable {
        if session.ceiling_reached() {
            pass.halted = true;
            return Ok(pass);
        }
        for i in unstable {
            session.count_iteration(&mut checkers[i]);
        }
        session.running.outer_loop_total_iterations += 1;
        session.solve(VoltageInitializer::Previous)?;
        if !session.converged() || session.ceiling_reached() {
            pass.halted = true;
        }
    }
    Ok(pass)
}
