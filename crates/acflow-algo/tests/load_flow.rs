//! End-to-end load flow tests with the Newton-Raphson solver

use acflow_algo::parameters::{HvdcFreezeMode, SlackDistributionFailureBehavior};
use acflow_algo::{AcLoadFlowEngine, AcLoadFlowParameters, AcLoadFlowStatus};
use acflow_core::{
    AcEmulationStatus, AcFlowError, Area, AreaId, Branch, BranchId, BranchSide, Bus, BusId, Gen,
    GenId, HvdcId, HvdcLine, Load, LoadId, Network, PhaseControlMode, TapChanger,
};

/// Triangle network
/// Bus 1: slack, G1 (0-2 p.u.) holding 1.0 p.u.
/// Bus 2: G2 (0-1 p.u.) holding 1.0 p.u.
/// Bus 3: load 1.0 + j0.4 p.u.
fn create_3bus_network() -> Network {
    let mut network = Network::new();
    network.add_bus(Bus::new(BusId::new(1), "bus1", 138.0).as_slack()).unwrap();
    network.add_bus(Bus::new(BusId::new(2), "bus2", 138.0)).unwrap();
    network.add_bus(Bus::new(BusId::new(3), "bus3", 138.0)).unwrap();

    network
        .add_generator(
            Gen::new(GenId::new(1), "gen1", BusId::new(1))
                .with_target_p(0.3)
                .with_p_limits(0.0, 2.0)
                .with_voltage_control(BusId::new(1), 1.0),
        )
        .unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(2), "gen2", BusId::new(2))
                .with_target_p(0.3)
                .with_p_limits(0.0, 1.0)
                .with_voltage_control(BusId::new(2), 1.0),
        )
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load3", BusId::new(3), 1.0, 0.4))
        .unwrap();

    for (id, from, to) in [(1, 1, 2), (2, 2, 3), (3, 1, 3)] {
        network
            .add_branch(Branch::new(
                BranchId::new(id),
                format!("line{from}_{to}"),
                BusId::new(from),
                BusId::new(to),
                0.01,
                0.1,
            ))
            .unwrap();
    }
    network
}

fn without_distributed_slack() -> AcLoadFlowParameters {
    let mut parameters = AcLoadFlowParameters::default();
    parameters.slack.distributed_slack = false;
    parameters
}

#[test]
fn test_nothing_to_correct_needs_single_solve() {
    let mut network = create_3bus_network();
    let engine = AcLoadFlowEngine::new(without_distributed_slack()).unwrap();
    let result = engine.run(&mut network).unwrap();

    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.outer_loop_iterations, 0);
    assert_eq!(result.solve_count, 1);
    assert!(result.iterations_by_loop.is_empty());
    assert_eq!(result.distributed_active_power, 0.0);
}

#[test]
fn test_distributed_slack_balances_generation() {
    let mut network = create_3bus_network();
    let engine = AcLoadFlowEngine::new(AcLoadFlowParameters::default()).unwrap();
    let result = engine.run(&mut network).unwrap();

    assert!(result.is_ok(), "status {:?}", result.status);
    assert!(result.slack_bus_active_power_mismatch.abs() <= 0.01);
    assert!(result.iterations_by_loop["distributed_slack"] >= 1);

    let g1 = network.generator(GenId::new(1)).unwrap().target_p;
    let g2 = network.generator(GenId::new(2)).unwrap().target_p;
    // Load plus losses, shared 2:1 by p_max
    assert!(g1 + g2 > 1.0 && g1 + g2 < 1.05, "targets {g1} + {g2}");
    assert!(g1 - 0.3 > 1.9 * (g2 - 0.3));
    assert!((result.distributed_active_power - (g1 + g2 - 0.6)).abs() < 1e-9);
}

#[test]
fn test_reactive_limit_switches_generator_to_pq() {
    let mut network = create_3bus_network();
    network.generator_mut(GenId::new(2)).unwrap().min_q = -0.05;
    network.generator_mut(GenId::new(2)).unwrap().max_q = 0.05;

    let engine = AcLoadFlowEngine::new(without_distributed_slack()).unwrap();
    let result = engine.run(&mut network).unwrap();

    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.iterations_by_loop["reactive_limits"], 1);

    let gen2 = network.generator(GenId::new(2)).unwrap();
    assert_eq!(gen2.target_q, 0.05);
    assert!(!gen2.voltage_control.as_ref().unwrap().enabled);
    assert!(network.bus(BusId::new(2)).unwrap().v < 1.0);
}

#[test]
fn test_second_run_on_converged_network_is_a_no_op() {
    let mut network = create_3bus_network();
    network.generator_mut(GenId::new(2)).unwrap().max_q = 0.05;
    let engine = AcLoadFlowEngine::new(AcLoadFlowParameters::default()).unwrap();

    let first = engine.run(&mut network).unwrap();
    assert!(first.is_ok());
    let targets: Vec<f64> = network.generators().map(|g| g.target_p).collect();

    let second = engine.run(&mut network).unwrap();
    assert_eq!(second.status, AcLoadFlowStatus::Converged);
    assert_eq!(second.outer_loop_iterations, 0);
    assert_eq!(second.solve_count, 1);
    let again: Vec<f64> = network.generators().map(|g| g.target_p).collect();
    assert_eq!(targets, again);
}

#[test]
fn test_iteration_ceiling_is_respected() {
    let mut network = create_3bus_network();
    network.generator_mut(GenId::new(2)).unwrap().max_q = 0.05;
    let mut parameters = AcLoadFlowParameters::default();
    parameters.max_outer_loop_iterations = 1;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.outer_loop_iterations, 1);
    assert_eq!(result.solve_count, 2);
    assert_eq!(result.status, AcLoadFlowStatus::MaxOuterLoopIterations);
}

fn with_tight_p_limits(network: &mut Network) {
    for id in [1, 2] {
        network.generator_mut(GenId::new(id)).unwrap().max_p = 0.35;
    }
}

#[test]
fn test_fail_policy_rolls_back_distribution() {
    let mut network = create_3bus_network();
    with_tight_p_limits(&mut network);
    let mut parameters = AcLoadFlowParameters::default();
    parameters.slack.failure_behavior = SlackDistributionFailureBehavior::Fail;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.status, AcLoadFlowStatus::OuterLoopFailed);
    assert_eq!(result.distributed_active_power, 0.0);
    for gen in network.generators() {
        assert_eq!(gen.target_p, 0.3);
    }
}

#[test]
fn test_leave_on_slack_policy_keeps_saturated_targets() {
    let mut network = create_3bus_network();
    with_tight_p_limits(&mut network);

    let result = AcLoadFlowEngine::new(AcLoadFlowParameters::default())
        .unwrap()
        .run(&mut network)
        .unwrap();
    assert!(result.slack_bus_active_power_mismatch > 0.25);
    for gen in network.generators() {
        assert_eq!(gen.target_p, 0.35);
    }
}

#[test]
fn test_throw_policy_is_an_error() {
    let mut network = create_3bus_network();
    with_tight_p_limits(&mut network);
    let mut parameters = AcLoadFlowParameters::default();
    parameters.slack.failure_behavior = SlackDistributionFailureBehavior::Throw;

    let err = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap_err();
    assert!(matches!(
        err,
        AcFlowError::ActivePowerDistribution { remaining_mw } if remaining_mw > 25.0
    ));
}

/// Slack, a load bus and a tap-changing transformer feeding a 20 kV bus
fn create_transformer_network() -> Network {
    let mut network = Network::new();
    network.add_bus(Bus::new(BusId::new(1), "slack", 138.0).as_slack()).unwrap();
    network.add_bus(Bus::new(BusId::new(2), "hv", 138.0)).unwrap();
    network.add_bus(Bus::new(BusId::new(3), "mv", 20.0)).unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(1), "gen1", BusId::new(1))
                .with_voltage_control(BusId::new(1), 1.0),
        )
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load2", BusId::new(2), 0.5, 0.2))
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(2), "load3", BusId::new(3), 0.2, 0.05))
        .unwrap();
    network
        .add_branch(Branch::new(
            BranchId::new(1),
            "line1_2",
            BusId::new(1),
            BusId::new(2),
            0.01,
            0.1,
        ))
        .unwrap();
    network
        .add_branch(
            Branch::new(BranchId::new(2), "tr2_3", BusId::new(2), BusId::new(3), 0.0, 0.05)
                .with_ratio_tap_changer(TapChanger::uniform(0.9, 1.1, 21, 10))
                .with_voltage_control(BusId::new(3), 1.0, 0.02),
        )
        .unwrap();
    network
}

#[test]
fn test_incremental_transformer_control_lands_on_tap() {
    let mut network = create_transformer_network();
    let mut parameters = without_distributed_slack();
    parameters.voltage_control.transformer_voltage_control = true;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert!(result.iterations_by_loop["incremental_transformer_voltage_control"] >= 1);

    let branch = network.branch(BranchId::new(2)).unwrap();
    let tap = branch.ratio_tap_changer.as_ref().unwrap();
    assert!(tap.position > 10);
    assert_eq!(branch.rho, tap.value());
    // control handed back after the session
    assert!(branch.voltage_control.as_ref().unwrap().enabled);

    let v3 = network.bus(BusId::new(3)).unwrap().v;
    assert!((v3 - 1.0).abs() < 0.015, "v3 = {v3}");
}

#[test]
fn test_simple_transformer_control_rounds_continuous_ratio() {
    let mut network = create_transformer_network();
    let mut parameters = without_distributed_slack();
    parameters.voltage_control.transformer_voltage_control = true;
    parameters.voltage_control.transformer_mode = acflow_algo::parameters::ControlMode::Simple;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.iterations_by_loop["transformer_voltage_control"], 1);

    let branch = network.branch(BranchId::new(2)).unwrap();
    let tap = branch.ratio_tap_changer.as_ref().unwrap();
    assert!(!branch.voltage_control.as_ref().unwrap().enabled);
    assert_eq!(branch.rho, tap.value());
}

#[test]
fn test_solver_failure_is_reported() {
    let mut network = create_3bus_network();
    let mut parameters = without_distributed_slack();
    parameters.newton_raphson.max_iterations = 1;
    parameters.newton_raphson.tolerance = 1e-14;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.status, AcLoadFlowStatus::SolverFailed);
    assert_eq!(result.outer_loop_iterations, 0);
}

/// Slack bus feeding a 1.0 p.u. load through a line in parallel with a
/// 10 p.u./rad AC emulation link limited to 0.3 p.u. towards the load
fn create_hvdc_network() -> Network {
    let mut network = Network::new();
    network.add_bus(Bus::new(BusId::new(1), "slack", 400.0).as_slack()).unwrap();
    network.add_bus(Bus::new(BusId::new(2), "load", 400.0)).unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(1), "gen1", BusId::new(1))
                .with_voltage_control(BusId::new(1), 1.0),
        )
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load2", BusId::new(2), 1.0, 0.0))
        .unwrap();
    network
        .add_branch(Branch::new(
            BranchId::new(1),
            "line1_2",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.1,
        ))
        .unwrap();
    network
        .add_hvdc_line(
            HvdcLine::new(HvdcId::new(1), "hvdc1_2", BusId::new(1), BusId::new(2), 0.0)
                .with_ac_emulation(0.0, 10.0)
                .with_p_max(0.3, 0.3),
        )
        .unwrap();
    network
}

fn emulation_status(network: &Network) -> AcEmulationStatus {
    network
        .hvdc_line(HvdcId::new(1))
        .unwrap()
        .ac_emulation
        .as_ref()
        .unwrap()
        .status
}

#[test]
fn test_frozen_hvdc_link_saturates_once_after_release() {
    let mut network = create_hvdc_network();
    let mut parameters = without_distributed_slack();
    parameters.hvdc.freeze_mode = HvdcFreezeMode::AllLinks;
    let max_mode_switch = parameters.hvdc.max_mode_switch;

    let engine = AcLoadFlowEngine::new(parameters).unwrap();
    assert_eq!(
        engine.build_outer_loops().loop_names(),
        vec!["reactive_limits", "ac_emulation_freeze", "ac_emulation"]
    );
    let result = engine.run(&mut network).unwrap();

    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.iterations_by_loop["ac_emulation_freeze"], 1);
    assert_eq!(result.iterations_by_loop["ac_emulation"], 1);
    assert!(result.iterations_by_loop["ac_emulation"] <= max_mode_switch);
    assert_eq!(result.outer_loop_iterations, 2);
    // first solve, refreeze solve, release, saturation
    assert_eq!(result.solve_count, 4);

    assert_eq!(emulation_status(&network), AcEmulationStatus::SaturatedSide1);
    let link = network.hvdc_line(HvdcId::new(1)).unwrap();
    assert!((link.p1 - 0.3).abs() < 1e-9, "p1 = {}", link.p1);
    let line = network.branch(BranchId::new(1)).unwrap();
    assert!((line.flows.p1 - 0.7).abs() < 1e-4, "line p1 = {}", line.flows.p1);
}

#[test]
fn test_hvdc_mode_switch_limit_keeps_link_linear() {
    let mut network = create_hvdc_network();
    let mut parameters = without_distributed_slack();
    parameters.hvdc.max_mode_switch = 0;

    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();
    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.outer_loop_iterations, 0);
    assert!(!result.iterations_by_loop.contains_key("ac_emulation"));

    assert_eq!(emulation_status(&network), AcEmulationStatus::Linear);
    let link = network.hvdc_line(HvdcId::new(1)).unwrap();
    // voltage drop at the load bus pushes a little more through the link
    assert!((link.p1 - 0.5).abs() < 0.01, "p1 = {}", link.p1);
}

#[test]
fn test_phase_shifter_fixed_on_nearest_tap() {
    let mut network = Network::new();
    network.add_bus(Bus::new(BusId::new(1), "slack", 400.0).as_slack()).unwrap();
    network.add_bus(Bus::new(BusId::new(2), "load", 400.0)).unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(1), "gen1", BusId::new(1))
                .with_voltage_control(BusId::new(1), 1.0),
        )
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load2", BusId::new(2), 1.0, 0.0))
        .unwrap();
    network
        .add_branch(Branch::new(
            BranchId::new(1),
            "line1_2",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.1,
        ))
        .unwrap();
    network
        .add_branch(
            Branch::new(BranchId::new(2), "pst1_2", BusId::new(1), BusId::new(2), 0.0, 0.1)
                .with_phase_tap_changer(TapChanger::uniform(-0.2, 0.2, 41, 20))
                .with_phase_control(
                    PhaseControlMode::ActivePowerControl { target_p: 0.3 },
                    BranchSide::One,
                ),
        )
        .unwrap();

    let mut parameters = without_distributed_slack();
    parameters.voltage_control.phase_shifter_control = true;
    let result = AcLoadFlowEngine::new(parameters).unwrap().run(&mut network).unwrap();

    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.iterations_by_loop["phase_control"], 1);
    assert_eq!(result.solve_count, 2);

    let pst = network.branch(BranchId::new(2)).unwrap();
    let tap = pst.phase_tap_changer.as_ref().unwrap();
    assert!(!pst.phase_control.as_ref().unwrap().enabled);
    assert_ne!(tap.position, 20);
    assert_eq!(pst.alpha, tap.value());
    // half a 0.01 rad step around the 0.2 p.u. loop at most
    assert!((pst.flows.p1 - 0.3).abs() < 0.03, "pst p1 = {}", pst.flows.p1);
}

/// Two areas joined by one tie line, both generators participating.
/// North exports 0.5 p.u. before control, the schedule asks for 0.3.
fn create_two_area_network() -> Network {
    let mut network = Network::new();
    network
        .add_bus(Bus::new(BusId::new(1), "north", 400.0).as_slack().in_area(AreaId::new(1)))
        .unwrap();
    network
        .add_bus(Bus::new(BusId::new(2), "south", 400.0).in_area(AreaId::new(2)))
        .unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(1), "gen_north", BusId::new(1))
                .with_target_p(0.5)
                .with_p_limits(0.0, 2.0)
                .with_voltage_control(BusId::new(1), 1.0),
        )
        .unwrap();
    network
        .add_generator(
            Gen::new(GenId::new(2), "gen_south", BusId::new(2))
                .with_target_p(0.5)
                .with_p_limits(0.0, 2.0),
        )
        .unwrap();
    network
        .add_load(Load::new(LoadId::new(1), "load_south", BusId::new(2), 1.0, 0.0))
        .unwrap();
    network
        .add_branch(Branch::new(BranchId::new(1), "tie", BusId::new(1), BusId::new(2), 0.01, 0.1))
        .unwrap();
    network.areas = vec![
        Area::new(AreaId::new(1), "North", 0.3).with_boundary(BranchId::new(1), BranchSide::One),
        Area::new(AreaId::new(2), "South", -0.3).with_boundary(BranchId::new(1), BranchSide::Two),
    ];
    network
}

#[test]
fn test_area_interchange_meets_schedule() {
    let mut network = create_two_area_network();
    let mut parameters = AcLoadFlowParameters::default();
    parameters.area_interchange.enabled = true;

    let engine = AcLoadFlowEngine::new(parameters).unwrap();
    assert_eq!(engine.build_outer_loops().loop_names()[0], "area_interchange_control");
    let result = engine.run(&mut network).unwrap();

    assert_eq!(result.status, AcLoadFlowStatus::Converged);
    assert_eq!(result.iterations_by_loop["area_interchange_control"], 1);
    assert!(!result.iterations_by_loop.contains_key("distributed_slack"));

    let tie = network.branch(BranchId::new(1)).unwrap();
    // 2 MW default tolerance
    assert!((tie.flows.p1 - 0.3).abs() < 0.02, "north export {}", tie.flows.p1);
    assert!((tie.flows.p2 + 0.3).abs() < 0.02, "south export {}", tie.flows.p2);

    let north = network.generator(GenId::new(1)).unwrap().target_p;
    let south = network.generator(GenId::new(2)).unwrap().target_p;
    assert!((north - 0.3).abs() < 0.01, "north target {north}");
    assert!((south - 0.7).abs() < 0.01, "south target {south}");
    assert!((result.distributed_active_power - (north + south - 1.0)).abs() < 1e-9);
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_runs_match_sequential() {
    let engine = AcLoadFlowEngine::new(AcLoadFlowParameters::default()).unwrap();
    let mut networks: Vec<Network> = (0..4)
        .map(|k| {
            let mut network = create_3bus_network();
            network.load_mut(LoadId::new(1)).unwrap().p = 0.8 + 0.1 * k as f64;
            network
        })
        .collect();
    let mut sequential = networks.clone();

    let parallel = engine.run_parallel(&mut networks);
    for (network, result) in sequential.iter_mut().zip(parallel) {
        let expected = engine.run(network).unwrap();
        let result = result.unwrap();
        assert_eq!(result.status, expected.status);
        assert_eq!(result.outer_loop_iterations, expected.outer_loop_iterations);
        assert_eq!(result.solver_iterations, expected.solver_iterations);
    }
}
