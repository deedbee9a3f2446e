//! Outer loops written outside the crate, run through the public group API

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use acflow_algo::sensitivity::{SensitivityMatrix, SensitivityRequest};
use acflow_algo::{
    AcLoadFlowParameters, CorrectionUnit, LoopEnv, OuterLoop, OuterLoopContext, OuterLoopGroup,
    OuterLoopStatus, PowerFlowSolver, RunningContext, SensitivityService, SolveResult, SolverStatus,
    VoltageInitializer,
};
use acflow_core::{AcFlowError, AcFlowResult, Bus, BusId, Load, LoadId, Network};

/// Always converges in one Newton update
#[derive(Default)]
struct CountingSolver {
    calls: AtomicUsize,
}

impl PowerFlowSolver for CountingSolver {
    fn solve(
        &self,
        _network: &mut Network,
        _initializer: VoltageInitializer,
    ) -> AcFlowResult<SolveResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SolveResult {
            status: SolverStatus::Converged,
            iterations: 1,
            slack_bus_active_power_mismatch: 0.0,
        })
    }
}

struct NoSensitivity;

impl SensitivityService for NoSensitivity {
    fn compute(
        &self,
        _network: &Network,
        request: &SensitivityRequest,
    ) -> AcFlowResult<SensitivityMatrix> {
        Ok(SensitivityMatrix::zeros(&request.controls, &request.monitored))
    }
}

type Log = Arc<Mutex<Vec<String>>>;

/// Replays `unstable` Unstable verdicts, then reports Stable.
struct Replay {
    name: &'static str,
    unstable: usize,
    log: Log,
}

impl Replay {
    fn unit(name: &'static str, unstable: usize, log: &Log) -> CorrectionUnit {
        CorrectionUnit::outer_loop(Replay {
            name,
            unstable,
            log: log.clone(),
        })
    }

    fn record(&self, event: &str) {
        self.log.lock().unwrap().push(format!("{event}:{}", self.name));
    }
}

impl OuterLoop for Replay {
    type Data = usize;

    fn name(&self) -> &'static str {
        self.name
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<usize> {
        self.record("init");
        Ok(0)
    }

    fn check(
        &self,
        ctx: &mut OuterLoopContext<usize>,
        _env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        self.record("check");
        ctx.data += 1;
        Ok(if ctx.data <= self.unstable {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }

    fn cleanup(
        &self,
        _ctx: &mut OuterLoopContext<usize>,
        _env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        self.record("cleanup");
        Ok(())
    }
}

fn one_bus_network() -> Network {
    let mut network = Network::new();
    network.add_bus(Bus::new(BusId::new(1), "bus1", 20.0).as_slack()).unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load1", BusId::new(1), 0.5, 0.1))
        .unwrap();
    network
}

fn run(
    group: &mut OuterLoopGroup,
    network: &mut Network,
    solver: &CountingSolver,
) -> (AcFlowResult<OuterLoopStatus>, RunningContext) {
    let parameters = AcLoadFlowParameters::default();
    let mut running = RunningContext::new();
    let mut env = LoopEnv {
        network,
        sensitivity: &NoSensitivity,
        parameters: &parameters,
    };
    let status = group.run(&mut running, solver, &mut env);
    (status, running)
}

#[test]
fn test_nested_compensation_group_entered_lazily() {
    let log = Log::default();
    let mut group = OuterLoopGroup::simple(
        "root",
        vec![
            Replay::unit("first", 1, &log),
            CorrectionUnit::group(OuterLoopGroup::compensation(
                "nested",
                Replay::unit("compensation", 2, &log),
                vec![Replay::unit("checker", 1, &log)],
            )),
        ],
    );
    let mut network = one_bus_network();
    let solver = CountingSolver::default();
    let (status, running) = run(&mut group, &mut network, &solver);

    assert_eq!(status.unwrap(), OuterLoopStatus::FullStable);
    assert_eq!(running.outer_loop_total_iterations, 4);
    assert_eq!(running.solve_count, 5);
    assert_eq!(solver.calls.load(Ordering::SeqCst), 5);
    assert_eq!(running.iterations_of("first"), 1);
    assert_eq!(running.iterations_of("compensation"), 2);
    assert_eq!(running.iterations_of("checker"), 1);

    let expected = [
        "init:first",
        "check:first",
        "init:compensation",
        "init:checker",
        "check:compensation",
        "check:compensation",
        "check:compensation",
        "check:checker",
        "check:compensation",
        "check:checker",
        "check:first",
        "check:compensation",
        "check:checker",
        "cleanup:checker",
        "cleanup:compensation",
        "cleanup:first",
    ];
    assert_eq!(*log.lock().unwrap(), expected);
}

/// Scales every load on initialize and puts the original values back on cleanup
struct LoadScaling {
    factor: f64,
}

impl OuterLoop for LoadScaling {
    type Data = Vec<(LoadId, f64)>;

    fn name(&self) -> &'static str {
        "load_scaling"
    }

    fn initialize(&self, env: &mut LoopEnv<'_>) -> AcFlowResult<Vec<(LoadId, f64)>> {
        let mut original = Vec::new();
        for load in env.network.loads_mut() {
            original.push((load.id, load.p));
            load.p *= self.factor;
        }
        Ok(original)
    }

    fn check(
        &self,
        _ctx: &mut OuterLoopContext<Self::Data>,
        _env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        Ok(OuterLoopStatus::Stable)
    }

    fn cleanup(
        &self,
        ctx: &mut OuterLoopContext<Self::Data>,
        env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<()> {
        for (id, p) in &ctx.data {
            if let Some(load) = env.network.load_mut(*id) {
                load.p = *p;
            }
        }
        Ok(())
    }

    fn distributed_active_power(&self, data: &Self::Data) -> f64 {
        data.iter().map(|(_, p)| p * (self.factor - 1.0)).sum()
    }

    fn modifies_model_on_initialize(&self) -> bool {
        true
    }
}

struct Broken;

impl OuterLoop for Broken {
    type Data = ();

    fn name(&self) -> &'static str {
        "broken"
    }

    fn initialize(&self, _env: &mut LoopEnv<'_>) -> AcFlowResult<()> {
        Ok(())
    }

    fn check(
        &self,
        _ctx: &mut OuterLoopContext<()>,
        _env: &mut LoopEnv<'_>,
    ) -> AcFlowResult<OuterLoopStatus> {
        Err(AcFlowError::Other("measurement missing".into()))
    }
}

#[test]
fn test_cleanup_restores_model_after_error() {
    let mut group = OuterLoopGroup::simple(
        "root",
        vec![
            CorrectionUnit::outer_loop(LoadScaling { factor: 2.0 }),
            CorrectionUnit::outer_loop(Broken),
        ],
    );
    let mut network = one_bus_network();
    let solver = CountingSolver::default();
    let (status, running) = run(&mut group, &mut network, &solver);

    assert!(matches!(status, Err(AcFlowError::Other(_))));
    assert_eq!(running.solve_count, 1);
    assert_eq!(network.load(LoadId::new(1)).unwrap().p, 0.5);
}

#[test]
fn test_distributed_power_collected_on_exit() {
    let scaling = CorrectionUnit::outer_loop(LoadScaling { factor: 1.5 });
    let mut group = OuterLoopGroup::simple("root", vec![scaling]);
    let mut network = one_bus_network();
    let solver = CountingSolver::default();
    let (status, running) = run(&mut group, &mut network, &solver);

    assert_eq!(status.unwrap(), OuterLoopStatus::FullStable);
    assert_eq!(running.outer_loop_total_iterations, 0);
    assert!((running.distributed_active_power - 0.25).abs() < 1e-12);
    assert_eq!(network.load(LoadId::new(1)).unwrap().p, 0.5);
}
